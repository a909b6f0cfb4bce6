//! [`StorageEngine`] over a document index.
//!
//! Key-value records are indexed as [`Record`] documents whose id is the
//! physical key. Dataset documents share the index and are told apart by
//! their `data_type`. Unbounded queries go through the [`PageWalker`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::context::RequestContext;
use crate::storage::codec;
use crate::storage::search::{index_mapping, Query, SearchBackend, SearchRequest};
use crate::storage::{
    require_filters, DataType, DeleteReport, DocumentStore, FieldFilters, KeyValuePair,
    KeyValueStore, KeyVersion, Page, PageRequest, PageWalker, Record, StorageEngine,
    StorageError, StorageResult, SEARCH_LIMIT,
};

/// Field holding the physical key of a record.
const KEY_FIELD: &str = "key";

/// Search-index backed storage engine.
pub struct SearchIndexEngine {
    client: Arc<dyn SearchBackend>,
    index: String,
    walker: PageWalker,
}

impl SearchIndexEngine {
    pub fn new(client: Arc<dyn SearchBackend>, index: impl Into<String>, page_cap: usize) -> Self {
        Self {
            client,
            index: index.into(),
            walker: PageWalker::new(page_cap),
        }
    }

    /// Creates the index with the fixed mapping unless it already exists.
    pub async fn ensure_index(&self) -> StorageResult<()> {
        if self.client.index_exists(&self.index).await? {
            debug!(index = %self.index, "index already exists");
            return Ok(());
        }
        if self.client.create_index(&self.index, &index_mapping()).await? {
            info!(index = %self.index, "created index");
        }
        Ok(())
    }

    async fn write_record(&self, ctx: &RequestContext, id: &str, record: &Record) -> StorageResult<()> {
        let body = serde_json::to_value(record)?;
        ctx.run(self.client.index_document(&self.index, id, &body)).await
    }

    /// Dataset documents under `id` read as absent.
    async fn read_record(&self, ctx: &RequestContext, id: &str) -> StorageResult<Option<Record>> {
        match ctx.run(self.client.get_document(&self.index, id)).await? {
            Some(source) if is_record(&source) => Ok(Some(serde_json::from_value(source)?)),
            Some(_) => {
                debug!(id, "document is not a key-value record");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Walks every hit of `query`, returning `(id, source)` pairs.
    async fn collect_hits(
        &self,
        ctx: &RequestContext,
        query: Query,
        includes: Option<&[&str]>,
    ) -> StorageResult<Vec<(String, Value)>> {
        let client = &self.client;
        let index = self.index.as_str();
        let query = &query;

        self.walker
            .collect(ctx, move |page: PageRequest| async move {
                let mut request = SearchRequest::new(query.clone(), page);
                if let Some(fields) = includes {
                    request = request.include_fields(fields);
                }
                let hits = client.search(index, &request).await?;
                Ok::<_, StorageError>(Page::new(hits.hits, hits.total).map(|hit| (hit.id, hit.source)))
            })
            .await
    }

    /// Ids of up to `limit` records whose key starts with `prefix`.
    async fn search_ids(&self, ctx: &RequestContext, prefix: &str, limit: usize) -> StorageResult<Vec<String>> {
        let request = SearchRequest::new(
            Query::prefix(KEY_FIELD, prefix),
            PageRequest { from: 0, size: limit },
        )
        .include_fields(&[KEY_FIELD]);
        let hits = ctx.run(self.client.search(&self.index, &request)).await?;
        Ok(hits.hits.into_iter().map(|hit| hit.id).collect())
    }
}

fn is_record(source: &Value) -> bool {
    source.get("data_type").and_then(Value::as_str) == Some(DataType::Default.as_str())
}

#[async_trait]
impl KeyValueStore for SearchIndexEngine {
    async fn put(&self, ctx: &RequestContext, key: &str, value: &str) -> StorageResult<()> {
        let id = codec::encode_plain(key)?;
        self.write_record(ctx, &id, &Record::plain(id.as_str(), value)).await
    }

    async fn get(&self, ctx: &RequestContext, key: &str) -> StorageResult<HashMap<String, String>> {
        let id = codec::encode_plain(key)?;
        let mut result = HashMap::new();
        if let Some(record) = self.read_record(ctx, &id).await? {
            result.insert(key.to_string(), record.value);
        }
        Ok(result)
    }

    async fn get_with_prefix(&self, ctx: &RequestContext, prefix: &str) -> StorageResult<Vec<KeyValuePair>> {
        let hits = self
            .collect_hits(ctx, Query::prefix(KEY_FIELD, prefix), None)
            .await?;
        let pairs = hits
            .into_iter()
            .map(|(_, source)| serde_json::from_value::<KeyValuePair>(source))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(prefix, count = pairs.len(), "prefix scan");
        Ok(pairs)
    }

    async fn put_with_version(
        &self,
        ctx: &RequestContext,
        version: &str,
        key: &str,
        value: &str,
    ) -> StorageResult<()> {
        let id = codec::encode_versioned(key, version)?;
        let record = Record::plain(id.as_str(), value).with_version(version);
        self.write_record(ctx, &id, &record).await
    }

    async fn get_with_version(
        &self,
        ctx: &RequestContext,
        version: &str,
        key: &str,
    ) -> StorageResult<HashMap<String, String>> {
        let id = codec::encode_versioned(key, version)?;
        let mut result = HashMap::new();
        if let Some(record) = self.read_record(ctx, &id).await? {
            result.insert(codec::decode_versioned(&id, version).to_string(), record.value);
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
        let id = codec::encode_user_versioned(user_id, version, key)?;
        let record = Record::plain(id.as_str(), value)
            .with_version(version)
            .with_user_id(user_id);
        self.write_record(ctx, &id, &record).await
    }

    async fn user_get_with_version(
        &self,
        ctx: &RequestContext,
        version: &str,
        key: &str,
    ) -> StorageResult<HashMap<String, String>> {
        let user_id = ctx.require_user_id()?;
        let id = codec::encode_user_versioned(user_id, version, key)?;
        let mut result = HashMap::new();
        if let Some(record) = self.read_record(ctx, &id).await? {
            result.insert(
                codec::decode_user_versioned(&id, user_id, version).to_string(),
                record.value,
            );
        }
        Ok(result)
    }

    async fn search_with_key(&self, ctx: &RequestContext, prefix: &str) -> StorageResult<Vec<KeyVersion>> {
        let ids = self.search_ids(ctx, prefix, SEARCH_LIMIT).await?;
        Ok(ids
            .iter()
            .filter_map(|id| codec::split_version_key(id))
            .map(|(version, key)| KeyVersion {
                key: key.to_string(),
                version: version.to_string(),
            })
            .collect())
    }

    async fn delete_with_key(&self, ctx: &RequestContext, prefix: &str) -> StorageResult<DeleteReport> {
        // Collect first: deleting while paging would shift the windows.
        let ids: Vec<String> = self
            .collect_hits(ctx, Query::prefix(KEY_FIELD, prefix), Some(&[KEY_FIELD][..]))
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect();

        let mut report = DeleteReport::default();
        for id in ids {
            match ctx.run(self.client.delete_document(&self.index, &id)).await {
                Ok(_) => report.deleted.push(id),
                Err(e) if ctx.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(id = %id, error = %e, "bulk delete skipped record");
                    report.failed.push(id);
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

#[async_trait]
impl DocumentStore for SearchIndexEngine {
    async fn put_data(&self, ctx: &RequestContext, id: &str, document: &Value) -> StorageResult<()> {
        let id = codec::encode_plain(id)?;
        ctx.run(self.client.index_document(&self.index, &id, document)).await
    }

    async fn get_data(&self, ctx: &RequestContext, id: &str) -> StorageResult<Option<Value>> {
        let id = codec::encode_plain(id)?;
        ctx.run(self.client.get_document(&self.index, &id)).await
    }

    async fn update_data(&self, ctx: &RequestContext, id: &str, partial: &Value) -> StorageResult<bool> {
        let id = codec::encode_plain(id)?;
        ctx.run(self.client.update_document(&self.index, &id, partial)).await
    }

    async fn delete_data(&self, ctx: &RequestContext, id: &str) -> StorageResult<()> {
        let id = codec::encode_plain(id)?;
        if !ctx.run(self.client.delete_document(&self.index, &id)).await? {
            debug!(id = %id, "delete of absent document");
        }
        Ok(())
    }

    async fn get_data_by_kvs(&self, ctx: &RequestContext, filters: &FieldFilters) -> StorageResult<Vec<Value>> {
        require_filters(filters)?;
        let query = Query::Must(
            filters
                .iter()
                .map(|(field, value)| Query::term(field.as_str(), value.clone()))
                .collect(),
        );
        let hits = self.collect_hits(ctx, query, None).await?;
        Ok(hits.into_iter().map(|(_, source)| source).collect())
    }
}

impl StorageEngine for SearchIndexEngine {
    fn name(&self) -> &'static str {
        "elasticsearch"
    }

    fn as_document_store(&self) -> Option<&dyn DocumentStore> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::search::MemoryIndex;
    use serde_json::json;

    const INDEX: &str = "persona";

    async fn engine_with_cap(page_cap: usize) -> (SearchIndexEngine, Arc<MemoryIndex>) {
        let backend = Arc::new(MemoryIndex::new());
        let engine = SearchIndexEngine::new(backend.clone(), INDEX, page_cap);
        engine.ensure_index().await.unwrap();
        (engine, backend)
    }

    #[tokio::test]
    async fn test_ensure_index_is_idempotent() {
        let (engine, backend) = engine_with_cap(10).await;
        engine.ensure_index().await.unwrap();
        assert_eq!(backend.mapping(INDEX), Some(index_mapping()));
    }

    #[tokio::test]
    async fn test_versioned_round_trip() {
        let (engine, backend) = engine_with_cap(10).await;
        let ctx = RequestContext::new();

        engine.put_with_version(&ctx, "v1", "theme", "dark").await.unwrap();
        let result = engine.get_with_version(&ctx, "v1", "theme").await.unwrap();
        assert_eq!(result, HashMap::from([("theme".to_string(), "dark".to_string())]));

        let stored = backend
            .get_document(INDEX, &codec::encode_versioned("theme", "v1").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored["version"], "v1");
        assert_eq!(stored["data_type"], "default");

        assert!(engine.get_with_version(&ctx, "v2", "theme").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_user_scope_isolation() {
        let (engine, _) = engine_with_cap(10).await;
        let alice = RequestContext::new().with_user_id("alice");
        let bob = RequestContext::new().with_user_id("bob");

        engine.user_put_with_version(&alice, "v1", "layout", "grid").await.unwrap();

        let mine = engine.user_get_with_version(&alice, "v1", "layout").await.unwrap();
        assert_eq!(mine.get("layout").map(String::as_str), Some("grid"));
        assert!(engine.user_get_with_version(&bob, "v1", "layout").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_user_scope_requires_user_id() {
        let (engine, _) = engine_with_cap(10).await;
        let result = engine
            .user_put_with_version(&RequestContext::new(), "v1", "layout", "grid")
            .await;
        assert!(matches!(result, Err(StorageError::Validation(_))));
    }

    #[tokio::test]
    async fn test_prefix_scan_drains_pages() {
        let (engine, backend) = engine_with_cap(1000).await;
        let ctx = RequestContext::new();

        for i in 0..1500 {
            engine.put(&ctx, &format!("app_id:X:{i}"), "v").await.unwrap();
        }
        engine.put(&ctx, "app_id:Y:0", "v").await.unwrap();

        let searches_before = backend.search_count();
        let all = engine.get_with_prefix(&ctx, "app_id:X").await.unwrap();
        assert_eq!(all.len(), 1500);
        assert_eq!(backend.search_count() - searches_before, 2);

        engine.put(&ctx, "app_id:X:extra", "v").await.unwrap();
        assert_eq!(engine.get_with_prefix(&ctx, "app_id:X").await.unwrap().len(), 1501);
    }

    #[tokio::test]
    async fn test_search_and_delete_with_key() {
        let (engine, _) = engine_with_cap(2).await;
        let ctx = RequestContext::new();

        for (id, value) in [("v1\u{1f}alpha", "a"), ("v1\u{1f}beta", "b")] {
            engine.write_record(&ctx, id, &Record::plain(id, value)).await.unwrap();
        }
        engine.put(&ctx, "v1-malformed", "c").await.unwrap();
        engine.put(&ctx, "other", "d").await.unwrap();

        let mut found = engine.search_with_key(&ctx, "v1").await.unwrap();
        found.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(
            found,
            vec![
                KeyVersion { key: "alpha".into(), version: "v1".into() },
                KeyVersion { key: "beta".into(), version: "v1".into() },
            ]
        );

        let report = engine.delete_with_key(&ctx, "v1").await.unwrap();
        assert_eq!(report.deleted.len(), 3);
        assert!(report.failed.is_empty());
        assert!(engine.get_with_prefix(&ctx, "v1").await.unwrap().is_empty());
        assert_eq!(engine.get(&ctx, "other").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_documents() {
        let (engine, _) = engine_with_cap(10).await;
        let ctx = RequestContext::new();
        let docs = engine.documents().unwrap();

        docs.put_data(&ctx, "d1", &json!({"id": "d1", "name": "n", "type": 1}))
            .await
            .unwrap();
        docs.put_data(&ctx, "d2", &json!({"id": "d2", "name": "n", "type": 2}))
            .await
            .unwrap();

        let filters = FieldFilters::from([
            ("name".to_string(), json!("n")),
            ("type".to_string(), json!(1)),
        ]);
        let matched = docs.get_data_by_kvs(&ctx, &filters).await.unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0]["id"], "d1");

        assert!(docs.update_data(&ctx, "d1", &json!({"name": "m"})).await.unwrap());
        assert_eq!(docs.get_data(&ctx, "d1").await.unwrap().unwrap()["name"], "m");

        docs.delete_data(&ctx, "d1").await.unwrap();
        assert!(docs.get_data(&ctx, "d1").await.unwrap().is_none());
        docs.delete_data(&ctx, "d1").await.unwrap();
    }

    #[tokio::test]
    async fn test_plain_get_skips_dataset_documents() {
        let (engine, _) = engine_with_cap(10).await;
        let ctx = RequestContext::new();
        engine
            .documents()
            .unwrap()
            .put_data(&ctx, "ds-1", &json!({"id": "ds-1", "name": "n", "data_type": "dataSet"}))
            .await
            .unwrap();

        assert!(engine.get(&ctx, "ds-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_plain_put_rejects_separator() {
        let (engine, _) = engine_with_cap(10).await;
        let anon = RequestContext::new();
        let alice = RequestContext::new().with_user_id("alice");

        let result = engine.put(&anon, "alice\u{1f}v1\u{1f}layout", "evil").await;
        assert!(matches!(result, Err(StorageError::Validation(_))));
        assert!(engine.user_get_with_version(&alice, "v1", "layout").await.unwrap().is_empty());
        assert!(engine.put(&anon, "..", "v").await.is_err());
    }

    #[tokio::test]
    async fn test_empty_filters_rejected_before_backend() {
        let (engine, backend) = engine_with_cap(10).await;
        let result = engine
            .get_data_by_kvs(&RequestContext::new(), &FieldFilters::new())
            .await;
        assert!(matches!(result, Err(StorageError::Validation(_))));
        assert_eq!(backend.search_count(), 0);
    }
}
