//! In-process [`SearchBackend`].
//!
//! Keeps each index as an ordered map of id to source document. Queries,
//! from/size windows, totals, source filtering and partial updates follow
//! the search backend's semantics closely enough for the engine to behave
//! the same against either implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::debug;

use crate::storage::search::{Hit, SearchBackend, SearchHits, SearchRequest};
use crate::storage::{StorageError, StorageResult};

/// Ordered document store keyed by id.
type Documents = BTreeMap<String, Value>;

#[derive(Default)]
struct MemoryIndexInner {
    indices: HashMap<String, Documents>,
    mappings: HashMap<String, Value>,
}

/// In-memory document index.
#[derive(Default)]
pub struct MemoryIndex {
    inner: RwLock<MemoryIndexInner>,
    searches: AtomicUsize,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of search requests served so far.
    pub fn search_count(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }

    /// Mapping the index was created with, if it was created explicitly.
    pub fn mapping(&self, index: &str) -> Option<Value> {
        self.inner.read().mappings.get(index).cloned()
    }
}

fn filter_source(source: &Value, includes: Option<&Vec<String>>) -> Value {
    match (includes, source) {
        (Some(fields), Value::Object(map)) => {
            let filtered: Map<String, Value> = map
                .iter()
                .filter(|(name, _)| fields.iter().any(|f| f == *name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
            Value::Object(filtered)
        }
        _ => source.clone(),
    }
}

#[async_trait]
impl SearchBackend for MemoryIndex {
    async fn ping(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn index_exists(&self, index: &str) -> StorageResult<bool> {
        Ok(self.inner.read().indices.contains_key(index))
    }

    async fn create_index(&self, index: &str, mapping: &Value) -> StorageResult<bool> {
        let mut inner = self.inner.write();
        if inner.indices.contains_key(index) {
            return Ok(false);
        }
        inner.indices.insert(index.to_string(), Documents::new());
        inner.mappings.insert(index.to_string(), mapping.clone());
        debug!(index, "created in-memory index");
        Ok(true)
    }

    async fn index_document(&self, index: &str, id: &str, body: &Value) -> StorageResult<()> {
        // Writes auto-create the index, like the real backend.
        self.inner
            .write()
            .indices
            .entry(index.to_string())
            .or_default()
            .insert(id.to_string(), body.clone());
        Ok(())
    }

    async fn get_document(&self, index: &str, id: &str) -> StorageResult<Option<Value>> {
        Ok(self
            .inner
            .read()
            .indices
            .get(index)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn update_document(&self, index: &str, id: &str, partial: &Value) -> StorageResult<bool> {
        let Value::Object(fields) = partial else {
            return Err(StorageError::Validation(
                "partial update must be a JSON object".to_string(),
            ));
        };

        let mut inner = self.inner.write();
        let Some(existing) = inner.indices.get_mut(index).and_then(|docs| docs.get_mut(id)) else {
            return Ok(false);
        };
        match existing {
            Value::Object(current) => {
                for (name, value) in fields {
                    current.insert(name.clone(), value.clone());
                }
            }
            other => *other = partial.clone(),
        }
        Ok(true)
    }

    async fn delete_document(&self, index: &str, id: &str) -> StorageResult<bool> {
        Ok(self
            .inner
            .write()
            .indices
            .get_mut(index)
            .and_then(|docs| docs.remove(id))
            .is_some())
    }

    async fn search(&self, index: &str, request: &SearchRequest) -> StorageResult<SearchHits> {
        self.searches.fetch_add(1, Ordering::SeqCst);

        let inner = self.inner.read();
        let docs = inner
            .indices
            .get(index)
            .ok_or_else(|| StorageError::Backend(format!("index_not_found: {}", index)))?;

        let matching: Vec<(&String, &Value)> = docs
            .iter()
            .filter(|(_, source)| request.query.matches(source))
            .collect();

        let hits = matching
            .iter()
            .skip(request.from)
            .take(request.size)
            .map(|(id, source)| Hit {
                id: (*id).clone(),
                source: filter_source(source, request.source_includes.as_ref()),
            })
            .collect();

        Ok(SearchHits {
            total: matching.len() as u64,
            hits,
        })
    }
}
