//! Engine selection at startup.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::storage::kv::{EtcdKv, EtcdKvConfig, KvBackend, LogKvEngine, SledKv, SledKvConfig};
use crate::storage::search::{HttpSearchClient, HttpSearchConfig, SearchBackend, SearchIndexEngine};
use crate::storage::{StorageEngine, StorageError, StorageResult};

/// The configured storage backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Elasticsearch,
    Etcd,
}

impl FromStr for BackendKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "es" | "elasticsearch" => Ok(BackendKind::Elasticsearch),
            "etcd" => Ok(BackendKind::Etcd),
            other => Err(StorageError::Config(format!(
                "unsupported backend {:?}, expected \"es\" or \"etcd\"",
                other
            ))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Elasticsearch => write!(f, "elasticsearch"),
            BackendKind::Etcd => write!(f, "etcd"),
        }
    }
}

/// Builds the engine named by `config.backend_storage`, together with the
/// single client handle it owns.
///
/// The search backend is pinged and its index created before returning, so
/// an unreachable cluster fails startup rather than the first request.
pub async fn open_engine(config: &Config) -> StorageResult<Arc<dyn StorageEngine>> {
    let kind: BackendKind = config.backend_storage.parse()?;
    info!(backend = %kind, host_name = %config.host_name, "opening storage engine");

    match kind {
        BackendKind::Elasticsearch => {
            let es = &config.elasticsearch;
            let client = HttpSearchClient::new(HttpSearchConfig {
                hosts: es.hosts.clone(),
                username: es.username.clone(),
                password: es.password.clone(),
                timeout: es.timeout(),
                refresh_writes: es.refresh_writes,
            })?;
            client.ping().await?;

            let engine = SearchIndexEngine::new(Arc::new(client), &es.default_index, es.page_size);
            engine.ensure_index().await?;
            Ok(Arc::new(engine))
        }
        BackendKind::Etcd => {
            let etcd = &config.etcd;
            let backend: Arc<dyn KvBackend> = match &etcd.embedded_path {
                Some(path) => {
                    info!(path = %path.display(), "using embedded kv store");
                    SledKv::open(SledKvConfig {
                        data_dir: path.clone(),
                        ..Default::default()
                    })? as Arc<dyn KvBackend>
                }
                None => Arc::new(
                    EtcdKv::connect(EtcdKvConfig {
                        endpoints: etcd.addrs.clone(),
                        username: etcd.username.clone(),
                        password: etcd.password.clone(),
                        timeout: etcd.timeout(),
                    })
                    .await?,
                ),
            };
            Ok(Arc::new(LogKvEngine::new(backend, config.host_name.clone())?))
        }
    }
}
