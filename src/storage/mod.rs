//! Storage layer: one backend-agnostic contract, two engines.
//!
//! Callers only ever see logical keys. The engines shape them into physical
//! keys with the [`codec`], drain large result sets with the
//! [`pagination`] walker, and talk to their backend through an injected
//! client handle.
//!
//! The contract is split by capability:
//!
//! - [`KeyValueStore`]: plain, versioned and user-scoped put/get, prefix
//!   scan, key search and bulk delete. Both engines implement it.
//! - [`DocumentStore`]: arbitrary JSON documents with filter queries. Only
//!   the search-index engine implements it.
//!
//! [`StorageEngine::documents`] fails with [`StorageError::Unsupported`] on
//! an engine without the document capability instead of returning empty
//! results.

pub mod codec;
pub mod factory;
pub mod kv;
pub mod pagination;
pub mod search;

pub use factory::{open_engine, BackendKind};
pub use kv::LogKvEngine;
pub use pagination::{Page, PageRequest, PageWalker, MAX_PAGE_SIZE};
pub use search::SearchIndexEngine;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::context::RequestContext;

/// Storage layer errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection failures and timeouts. Callers may retry.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Invalid argument: {0}")]
    Validation(String),

    #[error("{engine} engine does not support {capability}")]
    Unsupported {
        engine: &'static str,
        capability: &'static str,
    },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Whether the caller may retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Discriminates key-value records from dataset documents in a shared index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "dataSet")]
    DataSet,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Default => "default",
            DataType::DataSet => "dataSet",
        }
    }
}

/// The physical unit stored by the search-index engine for key-value data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Physical key the record is stored under.
    pub key: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub data_type: DataType,
}

impl Record {
    pub fn plain(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            version: None,
            user_id: None,
            data_type: DataType::Default,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// A key and its value, as exported by prefix scans and accepted by imports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValuePair {
    pub key: String,
    pub value: String,
}

/// A physical key split back into its version and key segments.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyVersion {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

/// Outcome of a best-effort bulk delete.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteReport {
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

/// Exact-match field filters, conjoined with AND.
pub type FieldFilters = BTreeMap<String, Value>;

/// Flat key-value capability shared by every engine.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Stores `value` under the raw key.
    async fn put(&self, ctx: &RequestContext, key: &str, value: &str) -> StorageResult<()>;

    /// Returns `{key: value}`, or an empty map if the key is absent.
    async fn get(&self, ctx: &RequestContext, key: &str) -> StorageResult<HashMap<String, String>>;

    /// Returns every record whose physical key starts with `prefix`.
    async fn get_with_prefix(
        &self,
        ctx: &RequestContext,
        prefix: &str,
    ) -> StorageResult<Vec<KeyValuePair>>;

    async fn put_with_version(
        &self,
        ctx: &RequestContext,
        version: &str,
        key: &str,
        value: &str,
    ) -> StorageResult<()>;

    /// Returns `{key: value}` keyed by the logical key, or an empty map.
    async fn get_with_version(
        &self,
        ctx: &RequestContext,
        version: &str,
        key: &str,
    ) -> StorageResult<HashMap<String, String>>;

    /// Like [`put_with_version`](Self::put_with_version), scoped to the
    /// context's user id.
    async fn user_put_with_version(
        &self,
        ctx: &RequestContext,
        version: &str,
        key: &str,
        value: &str,
    ) -> StorageResult<()>;

    async fn user_get_with_version(
        &self,
        ctx: &RequestContext,
        version: &str,
        key: &str,
    ) -> StorageResult<HashMap<String, String>>;

    /// Finds up to [`SEARCH_LIMIT`] physical keys starting with `prefix` and
    /// splits each into `{version, key}`. Keys without a separator are
    /// skipped.
    async fn search_with_key(
        &self,
        ctx: &RequestContext,
        prefix: &str,
    ) -> StorageResult<Vec<KeyVersion>>;

    /// Deletes every record whose physical key starts with `prefix`. A failed
    /// delete is listed in the report and does not stop the batch.
    async fn delete_with_key(&self, ctx: &RequestContext, prefix: &str)
        -> StorageResult<DeleteReport>;
}

/// Arbitrary JSON document capability.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn put_data(&self, ctx: &RequestContext, id: &str, document: &Value)
        -> StorageResult<()>;

    /// Returns `None` when no document exists under `id`.
    async fn get_data(&self, ctx: &RequestContext, id: &str) -> StorageResult<Option<Value>>;

    /// Merges the top-level fields of `partial` into the stored document.
    /// Returns `false` when no document exists under `id`.
    async fn update_data(&self, ctx: &RequestContext, id: &str, partial: &Value)
        -> StorageResult<bool>;

    /// Deleting an absent document is not an error.
    async fn delete_data(&self, ctx: &RequestContext, id: &str) -> StorageResult<()>;

    /// Returns every document matching all `filters`. At least one filter is
    /// required.
    async fn get_data_by_kvs(
        &self,
        ctx: &RequestContext,
        filters: &FieldFilters,
    ) -> StorageResult<Vec<Value>>;
}

/// A storage engine selected at startup.
pub trait StorageEngine: KeyValueStore {
    /// Short backend name used in logs and errors.
    fn name(&self) -> &'static str;

    /// The document capability, if this engine has one.
    fn as_document_store(&self) -> Option<&dyn DocumentStore> {
        None
    }

    /// The document capability, or [`StorageError::Unsupported`].
    fn documents(&self) -> StorageResult<&dyn DocumentStore> {
        self.as_document_store()
            .ok_or_else(|| StorageError::Unsupported {
                engine: self.name(),
                capability: "document operations",
            })
    }
}

/// Upper bound on keys returned by [`KeyValueStore::search_with_key`].
pub const SEARCH_LIMIT: usize = 500;

/// Rejects an empty filter set before any backend call.
pub(crate) fn require_filters(filters: &FieldFilters) -> StorageResult<()> {
    if filters.is_empty() {
        return Err(StorageError::Validation(
            "get_data_by_kvs needs one or more conditions".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_serialization_skips_absent_fields() {
        let json = serde_json::to_value(Record::plain("k", "v")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"key": "k", "value": "v", "data_type": "default"})
        );

        let record: Record = serde_json::from_value(serde_json::json!({
            "key": "k", "value": "v", "version": "1", "user_id": "u", "data_type": "default"
        }))
        .unwrap();
        assert_eq!(record, Record::plain("k", "v").with_version("1").with_user_id("u"));
    }

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(StorageError::Unavailable("timeout".into()).is_retryable());
        assert!(!StorageError::Backend("400".into()).is_retryable());
        assert!(!StorageError::Cancelled.is_retryable());
    }

    #[test]
    fn test_empty_filters_rejected() {
        assert!(matches!(
            require_filters(&FieldFilters::new()),
            Err(StorageError::Validation(_))
        ));
    }
}
