//! Sled-backed [`KvBackend`].
//!
//! Keeps the log/KV engine's data in a single sled tree. Used when no etcd
//! cluster is configured and by the test suite.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::storage::kv::KvBackend;
use crate::storage::{StorageError, StorageResult};

const KV_TREE: &str = "kv";

/// Configuration for [`SledKv`].
#[derive(Clone, Debug)]
pub struct SledKvConfig {
    /// Directory where sled stores all files.
    pub data_dir: PathBuf,

    /// Flush to disk after every write.
    pub sync_writes: bool,
}

impl Default for SledKvConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            sync_writes: false,
        }
    }
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        match err {
            sled::Error::Io(e) => StorageError::Unavailable(format!("sled I/O: {}", e)),
            other => StorageError::Backend(format!("sled: {}", other)),
        }
    }
}

fn utf8(bytes: &[u8]) -> StorageResult<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| StorageError::Backend(format!("non UTF-8 data in kv tree: {}", e)))
}

/// Embedded key-value store.
pub struct SledKv {
    db: sled::Db,
    tree: sled::Tree,
    sync_writes: bool,
}

impl SledKv {
    /// Opens or creates the database under `config.data_dir`.
    pub fn open(config: SledKvConfig) -> StorageResult<Arc<Self>> {
        debug!("Opening embedded kv store at {:?}", config.data_dir);

        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            StorageError::Config(format!(
                "cannot create data dir {}: {}",
                config.data_dir.display(),
                e
            ))
        })?;

        let db = sled::open(&config.data_dir).map_err(|e| {
            StorageError::Config(format!("Failed to open sled database: {}", e))
        })?;
        let tree = db.open_tree(KV_TREE)?;

        info!(
            "Embedded kv store ready with {} keys (sync_writes={})",
            tree.len(),
            config.sync_writes
        );

        Ok(Arc::new(Self {
            db,
            tree,
            sync_writes: config.sync_writes,
        }))
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    fn after_write(&self) -> StorageResult<()> {
        if self.sync_writes {
            self.db.flush()?;
        }
        Ok(())
    }
}

#[async_trait]
impl KvBackend for SledKv {
    async fn put(&self, key: &str, value: &str) -> StorageResult<()> {
        self.tree.insert(key.as_bytes(), value.as_bytes())?;
        self.after_write()
    }

    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        self.tree
            .get(key.as_bytes())?
            .map(|v| utf8(&v))
            .transpose()
    }

    async fn get_prefix(&self, prefix: &str, limit: usize) -> StorageResult<Vec<(String, String)>> {
        let mut results = Vec::new();

        for item in self.tree.scan_prefix(prefix.as_bytes()) {
            let (k, v) = item?;
            results.push((utf8(&k)?, utf8(&v)?));

            if limit > 0 && results.len() >= limit {
                break;
            }
        }

        Ok(results)
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let removed = self.tree.remove(key.as_bytes())?.is_some();
        self.after_write()?;
        Ok(removed)
    }
}
