//! Search-index engine.
//!
//! The engine stores key-value records and dataset documents in one index
//! and reaches the index through a [`SearchBackend`] handle:
//!
//! - [`HttpSearchClient`]: the Elasticsearch REST API over reqwest
//! - [`MemoryIndex`]: an in-process index with the same query semantics

pub mod engine;
pub mod http;
pub mod memory;

pub use engine::SearchIndexEngine;
pub use http::{HttpSearchClient, HttpSearchConfig};
pub use memory::MemoryIndex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::storage::{PageRequest, StorageResult};

/// Query subset used by the engine.
#[derive(Clone, Debug, PartialEq)]
pub enum Query {
    MatchAll,
    /// Exact match on a keyword field.
    Term { field: String, value: Value },
    /// Keyword field starts with `value`.
    Prefix { field: String, value: String },
    /// All clauses must match.
    Must(Vec<Query>),
}

impl Query {
    pub fn term(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Query::Term {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn prefix(field: impl Into<String>, value: impl Into<String>) -> Self {
        Query::Prefix {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Renders the query DSL.
    pub fn to_dsl(&self) -> Value {
        match self {
            Query::MatchAll => json!({ "match_all": {} }),
            Query::Term { field, value } => json!({ "term": { field: value } }),
            Query::Prefix { field, value } => json!({ "prefix": { field: value } }),
            Query::Must(clauses) => {
                let must: Vec<Value> = clauses.iter().map(Query::to_dsl).collect();
                json!({ "bool": { "must": must } })
            }
        }
    }

    /// Evaluates the query against a document source.
    pub fn matches(&self, source: &Value) -> bool {
        match self {
            Query::MatchAll => true,
            Query::Term { field, value } => source.get(field) == Some(value),
            Query::Prefix { field, value } => source
                .get(field)
                .and_then(Value::as_str)
                .is_some_and(|s| s.starts_with(value.as_str())),
            Query::Must(clauses) => clauses.iter().all(|clause| clause.matches(source)),
        }
    }
}

/// A search with an offset/size window.
#[derive(Clone, Debug)]
pub struct SearchRequest {
    pub query: Query,
    pub from: usize,
    pub size: usize,
    /// Restricts the returned `_source` to these fields.
    pub source_includes: Option<Vec<String>>,
}

impl SearchRequest {
    pub fn new(query: Query, page: PageRequest) -> Self {
        Self {
            query,
            from: page.from,
            size: page.size,
            source_includes: None,
        }
    }

    pub fn include_fields(mut self, fields: &[&str]) -> Self {
        self.source_includes = Some(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    /// Request body for `_search`. Totals are tracked exactly so the walker
    /// can rely on them past 10k hits.
    pub fn to_body(&self) -> Value {
        let mut body = json!({
            "query": self.query.to_dsl(),
            "from": self.from,
            "size": self.size,
            "track_total_hits": true,
        });
        if let Some(includes) = &self.source_includes {
            body["_source"] = json!({ "includes": includes });
        }
        body
    }
}

/// One search hit.
#[derive(Clone, Debug, PartialEq)]
pub struct Hit {
    pub id: String,
    pub source: Value,
}

/// Hits of one window plus the total match count.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SearchHits {
    pub total: u64,
    pub hits: Vec<Hit>,
}

/// Client handle to a document index.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Verifies the cluster is reachable.
    async fn ping(&self) -> StorageResult<()>;

    async fn index_exists(&self, index: &str) -> StorageResult<bool>;

    /// Creates `index` with `mapping`. Returns `false` if it already existed.
    async fn create_index(&self, index: &str, mapping: &Value) -> StorageResult<bool>;

    /// Creates or replaces the document under `id`.
    async fn index_document(&self, index: &str, id: &str, body: &Value) -> StorageResult<()>;

    async fn get_document(&self, index: &str, id: &str) -> StorageResult<Option<Value>>;

    /// Partial update. Returns `false` if the document does not exist.
    async fn update_document(&self, index: &str, id: &str, partial: &Value) -> StorageResult<bool>;

    /// Returns `false` if the document did not exist.
    async fn delete_document(&self, index: &str, id: &str) -> StorageResult<bool>;

    async fn search(&self, index: &str, request: &SearchRequest) -> StorageResult<SearchHits>;
}

/// Field schema applied when the index is created.
pub fn index_mapping() -> Value {
    json!({
        "mappings": {
            "properties": {
                "key": { "type": "keyword" },
                "version": { "type": "keyword" },
                "user_id": { "type": "keyword" },
                "data_type": { "type": "keyword" },
                "name": { "type": "keyword" },
                "id": { "type": "keyword" },
                "tag": { "type": "keyword" },
                "content": { "type": "keyword" },
                "created_at": { "type": "float" }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_must_query_dsl() {
        let query = Query::Must(vec![Query::term("name", "n"), Query::term("type", 1)]);
        assert_eq!(
            query.to_dsl(),
            json!({"bool": {"must": [
                {"term": {"name": "n"}},
                {"term": {"type": 1}}
            ]}})
        );
    }

    #[test]
    fn test_request_body() {
        let request = SearchRequest::new(Query::prefix("key", "app_id:"), PageRequest { from: 1000, size: 1000 })
            .include_fields(&["key"]);
        let body = request.to_body();
        assert_eq!(body["from"], 1000);
        assert_eq!(body["size"], 1000);
        assert_eq!(body["query"], json!({"prefix": {"key": "app_id:"}}));
        assert_eq!(body["_source"], json!({"includes": ["key"]}));
    }

    #[test]
    fn test_query_matching() {
        let doc = json!({"key": "app_id:1", "name": "n", "type": 1});
        assert!(Query::prefix("key", "app_id").matches(&doc));
        assert!(!Query::prefix("key", "user").matches(&doc));
        assert!(Query::Must(vec![Query::term("name", "n"), Query::term("type", 1)]).matches(&doc));
        assert!(!Query::term("type", 2).matches(&doc));
        assert!(!Query::term("missing", "x").matches(&doc));
    }

    #[test]
    fn test_mapping_has_dataset_fields() {
        let mapping = index_mapping();
        let props = &mapping["mappings"]["properties"];
        for field in ["key", "version", "user_id", "data_type", "id", "name", "tag", "content"] {
            assert_eq!(props[field]["type"], "keyword", "{field}");
        }
        assert_eq!(props["created_at"]["type"], "float");
    }
}
