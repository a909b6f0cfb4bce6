//! [`StorageEngine`] over a flat key-value log.
//!
//! Every physical key is prefixed with the deployment namespace. Versioned
//! reads fall back to the legacy `namespace_version_key` layout so data
//! written by older deployments stays readable.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::context::RequestContext;
use crate::storage::codec;
use crate::storage::kv::KvBackend;
use crate::storage::{
    DeleteReport, KeyValuePair, KeyValueStore, KeyVersion, StorageEngine, StorageError,
    StorageResult, SEARCH_LIMIT,
};

pub struct LogKvEngine {
    backend: Arc<dyn KvBackend>,
    namespace: String,
}

impl LogKvEngine {
    pub fn new(backend: Arc<dyn KvBackend>, namespace: impl Into<String>) -> StorageResult<Self> {
        let namespace = namespace.into();
        if namespace.is_empty() || namespace.contains(codec::SEPARATOR) {
            return Err(StorageError::Config(format!(
                "invalid key namespace {:?}",
                namespace
            )));
        }
        Ok(Self { backend, namespace })
    }

    fn physical(&self, key: &str) -> String {
        codec::namespaced(&self.namespace, key)
    }

    async fn read(&self, ctx: &RequestContext, physical: &str) -> StorageResult<Option<String>> {
        ctx.run(self.backend.get(physical)).await
    }

    async fn write(&self, ctx: &RequestContext, physical: &str, value: &str) -> StorageResult<()> {
        ctx.run(self.backend.put(physical, value)).await
    }

    /// Namespace-stripped keys and values under `prefix`.
    async fn scan(
        &self,
        ctx: &RequestContext,
        prefix: &str,
        limit: usize,
    ) -> StorageResult<Vec<(String, String)>> {
        let pairs = ctx
            .run(self.backend.get_prefix(&self.physical(prefix), limit))
            .await?;
        Ok(pairs
            .into_iter()
            .map(|(k, v)| (codec::strip_namespace(&self.namespace, &k).to_string(), v))
            .collect())
    }
}

#[async_trait]
impl KeyValueStore for LogKvEngine {
    async fn put(&self, ctx: &RequestContext, key: &str, value: &str) -> StorageResult<()> {
        let physical = self.physical(&codec::encode_plain(key)?);
        self.write(ctx, &physical, value).await
    }

    async fn get(&self, ctx: &RequestContext, key: &str) -> StorageResult<HashMap<String, String>> {
        let physical = self.physical(&codec::encode_plain(key)?);
        let mut result = HashMap::new();
        if let Some(value) = self.read(ctx, &physical).await? {
            result.insert(key.to_string(), value);
        }
        Ok(result)
    }

    async fn get_with_prefix(&self, ctx: &RequestContext, prefix: &str) -> StorageResult<Vec<KeyValuePair>> {
        let pairs = self.scan(ctx, prefix, 0).await?;
        debug!(prefix, count = pairs.len(), "prefix scan");
        Ok(pairs
            .into_iter()
            .map(|(key, value)| KeyValuePair { key, value })
            .collect())
    }

    async fn put_with_version(
        &self,
        ctx: &RequestContext,
        version: &str,
        key: &str,
        value: &str,
    ) -> StorageResult<()> {
        let physical = self.physical(&codec::encode_versioned(key, version)?);
        self.write(ctx, &physical, value).await
    }

    async fn get_with_version(
        &self,
        ctx: &RequestContext,
        version: &str,
        key: &str,
    ) -> StorageResult<HashMap<String, String>> {
        let encoded = codec::encode_versioned(key, version)?;
        let mut result = HashMap::new();

        if let Some(value) = self.read(ctx, &self.physical(&encoded)).await? {
            result.insert(codec::decode_versioned(&encoded, version).to_string(), value);
            return Ok(result);
        }

        let legacy = codec::legacy_versioned(&self.namespace, version, key);
        if let Some(value) = self.read(ctx, &legacy).await? {
            debug!(key, version, "served from legacy layout");
            result.insert(
                codec::decode_legacy_versioned(&legacy, &self.namespace, version).to_string(),
                value,
            );
        }
        Ok(result)
    }

    async fn user_put_with_version(
        &self,
        ctx: &RequestContext,
        version: &str,
        key: &str,
        value: &str,
    ) -> StorageResult<()> {
        let user_id = ctx.require_user_id()?;
        let physical = self.physical(&codec::encode_user_versioned(user_id, version, key)?);
        self.write(ctx, &physical, value).await
    }

    async fn user_get_with_version(
        &self,
        ctx: &RequestContext,
        version: &str,
        key: &str,
    ) -> StorageResult<HashMap<String, String>> {
        let user_id = ctx.require_user_id()?;
        let encoded = codec::encode_user_versioned(user_id, version, key)?;
        let mut result = HashMap::new();
        if let Some(value) = self.read(ctx, &self.physical(&encoded)).await? {
            result.insert(
                codec::decode_user_versioned(&encoded, user_id, version).to_string(),
                value,
            );
        }
        Ok(result)
    }

    async fn search_with_key(&self, ctx: &RequestContext, prefix: &str) -> StorageResult<Vec<KeyVersion>> {
        let pairs = self.scan(ctx, prefix, SEARCH_LIMIT).await?;
        Ok(pairs
            .iter()
            .filter_map(|(physical, _)| codec::split_version_key(physical))
            .map(|(version, key)| KeyVersion {
                key: key.to_string(),
                version: version.to_string(),
            })
            .collect())
    }

    async fn delete_with_key(&self, ctx: &RequestContext, prefix: &str) -> StorageResult<DeleteReport> {
        let keys: Vec<String> = self
            .scan(ctx, prefix, 0)
            .await?
            .into_iter()
            .map(|(k, _)| k)
            .collect();

        let mut report = DeleteReport::default();
        for key in keys {
            match ctx.run(self.backend.delete(&self.physical(&key))).await {
                Ok(_) => report.deleted.push(key),
                Err(e) if ctx.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(key = %key, error = %e, "bulk delete skipped key");
                    report.failed.push(key);
                }
            }
        }

        info!(
            prefix,
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "bulk delete finished"
        );
        Ok(report)
    }
}

impl StorageEngine for LogKvEngine {
    fn name(&self) -> &'static str {
        "etcd"
    }
}
