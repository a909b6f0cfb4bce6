//! Log/KV engine over an etcd-style store.
//!
//! The engine only needs string keys, prefix reads and single-key deletes,
//! so the backend seam is the small [`KvBackend`] trait. [`EtcdKv`] talks to
//! an etcd cluster; [`SledKv`] keeps the same data in an embedded sled
//! database for single-node deployments and tests.

pub mod embedded;
pub mod engine;
pub mod etcd;

pub use embedded::{SledKv, SledKvConfig};
pub use engine::LogKvEngine;
pub use etcd::{EtcdKv, EtcdKvConfig};

use async_trait::async_trait;

use crate::storage::StorageResult;

/// Raw string key-value operations a log/KV backend must provide.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn put(&self, key: &str, value: &str) -> StorageResult<()>;

    async fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Returns pairs whose key starts with `prefix`, in key order.
    /// If limit is 0, all matching keys are returned.
    async fn get_prefix(&self, prefix: &str, limit: usize) -> StorageResult<Vec<(String, String)>>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> StorageResult<bool>;
}
