//! etcd [`KvBackend`] over the v3 gRPC API.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, GetOptions, KvClient};
use tonic::Code;
use tracing::{info, warn};

use crate::storage::kv::KvBackend;
use crate::storage::{StorageError, StorageResult};

/// Connection settings for [`EtcdKv`].
#[derive(Clone, Debug)]
pub struct EtcdKvConfig {
    pub endpoints: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

fn map_error(err: etcd_client::Error) -> StorageError {
    match err {
        etcd_client::Error::TransportError(e) => StorageError::Unavailable(e.to_string()),
        etcd_client::Error::IoError(e) => StorageError::Unavailable(e.to_string()),
        etcd_client::Error::GRpcStatus(status)
            if matches!(
                status.code(),
                Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled
            ) =>
        {
            StorageError::Unavailable(status.to_string())
        }
        other => StorageError::Backend(other.to_string()),
    }
}

/// Client for a remote etcd cluster.
///
/// The underlying channel is multiplexed, so each call works on a cheap
/// clone of the KV client.
pub struct EtcdKv {
    kv: KvClient,
}

impl EtcdKv {
    pub async fn connect(config: EtcdKvConfig) -> StorageResult<Self> {
        if config.endpoints.is_empty() {
            return Err(StorageError::Config(
                "etcd.addrs must list at least one endpoint".to_string(),
            ));
        }

        let mut options = ConnectOptions::new()
            .with_connect_timeout(config.timeout)
            .with_timeout(config.timeout);
        if let Some(user) = config.username {
            options = options.with_user(user, config.password.unwrap_or_default());
        }

        let client = Client::connect(&config.endpoints, Some(options))
            .await
            .map_err(map_error)?;

        info!(endpoints = ?config.endpoints, "connected to etcd");
        Ok(Self {
            kv: client.kv_client(),
        })
    }
}

#[async_trait]
impl KvBackend for EtcdKv {
    async fn put(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut kv = self.kv.clone();
        kv.put(key, value, None).await.map_err(map_error)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let mut kv = self.kv.clone();
        let resp = kv.get(key, None).await.map_err(map_error)?;
        match resp.kvs().first() {
            Some(pair) => Ok(Some(pair.value_str().map_err(map_error)?.to_string())),
            None => Ok(None),
        }
    }

    async fn get_prefix(&self, prefix: &str, limit: usize) -> StorageResult<Vec<(String, String)>> {
        let mut kv = self.kv.clone();
        let mut options = GetOptions::new().with_prefix();
        if limit > 0 {
            options = options.with_limit(limit as i64);
        }

        let resp = kv.get(prefix, Some(options)).await.map_err(map_error)?;
        let mut results = Vec::with_capacity(resp.kvs().len());
        for pair in resp.kvs() {
            match (pair.key_str(), pair.value_str()) {
                (Ok(k), Ok(v)) => results.push((k.to_string(), v.to_string())),
                _ => warn!(key = ?pair.key(), "skipping non UTF-8 entry"),
            }
        }
        Ok(results)
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let mut kv = self.kv.clone();
        let resp = kv.delete(key, None).await.map_err(map_error)?;
        Ok(resp.deleted() > 0)
    }
}
