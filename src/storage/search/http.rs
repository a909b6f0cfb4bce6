//! Elasticsearch REST client.
//!
//! One `reqwest::Client` (and its connection pool) is created per process
//! and shared by every request. Hosts are tried in order until one answers
//! at the transport level.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::storage::search::{Hit, SearchBackend, SearchHits, SearchRequest};
use crate::storage::{StorageError, StorageResult};

/// Connection settings for [`HttpSearchClient`].
#[derive(Clone, Debug)]
pub struct HttpSearchConfig {
    pub hosts: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
    /// Append `refresh=wait_for` to writes so they are searchable on return.
    pub refresh_writes: bool,
}

/// Elasticsearch client over HTTP.
pub struct HttpSearchClient {
    hosts: Vec<Url>,
    client: reqwest::Client,
    username: Option<String>,
    password: Option<String>,
    refresh_writes: bool,
}

#[derive(Deserialize)]
struct GetResponse {
    #[serde(default)]
    found: bool,
    #[serde(rename = "_source")]
    source: Option<Value>,
}

#[derive(Deserialize)]
struct SearchResponse {
    hits: SearchResponseHits,
}

#[derive(Deserialize)]
struct SearchResponseHits {
    total: TotalHits,
    #[serde(default)]
    hits: Vec<SearchResponseHit>,
}

#[derive(Deserialize)]
struct TotalHits {
    value: u64,
}

#[derive(Deserialize)]
struct SearchResponseHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source", default)]
    source: Value,
}

fn transport_error(err: reqwest::Error) -> StorageError {
    if err.is_connect() || err.is_timeout() {
        StorageError::Unavailable(err.to_string())
    } else {
        StorageError::Backend(err.to_string())
    }
}

/// Server errors and throttling are retryable.
fn status_error(context: &str, status: StatusCode, body: &str) -> StorageError {
    let message = format!("{}: HTTP {} - {}", context, status, body);
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        StorageError::Unavailable(message)
    } else {
        StorageError::Backend(message)
    }
}

async fn error_from_response(context: &str, resp: Response) -> StorageError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    status_error(context, status, &body)
}

impl HttpSearchClient {
    pub fn new(config: HttpSearchConfig) -> StorageResult<Self> {
        if config.hosts.is_empty() {
            return Err(StorageError::Config(
                "elasticsearch.hosts must list at least one host".to_string(),
            ));
        }

        let hosts = config
            .hosts
            .iter()
            .map(|host| {
                Url::parse(host).map_err(|e| {
                    StorageError::Config(format!("invalid elasticsearch host {}: {}", host, e))
                })
            })
            .collect::<StorageResult<Vec<_>>>()?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| StorageError::Config(format!("failed to build HTTP client: {}", e)))?;

        info!(hosts = ?config.hosts, "elasticsearch client created");

        Ok(Self {
            hosts,
            client,
            username: config.username,
            password: config.password,
            refresh_writes: config.refresh_writes,
        })
    }

    /// Builds `{host}/{segments...}`, percent-encoding each segment.
    fn url(host: &Url, segments: &[&str]) -> StorageResult<Url> {
        let mut url = host.clone();
        url.path_segments_mut()
            .map_err(|_| StorageError::Config(format!("host {} cannot be a base URL", host)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_ref()),
            None => builder,
        }
    }

    /// Sends a request to the first host that accepts the connection.
    async fn send(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> StorageResult<Response> {
        let mut last_error = None;

        for host in &self.hosts {
            let url = Self::url(host, segments)?;
            let mut builder = self.authorize(self.client.request(method.clone(), url));
            if !query.is_empty() {
                builder = builder.query(query);
            }
            if let Some(body) = body {
                builder = builder.json(body);
            }

            match builder.send().await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_connect() => {
                    warn!(host = %host, error = %e, "elasticsearch host unreachable");
                    last_error = Some(transport_error(e));
                }
                Err(e) => return Err(transport_error(e)),
            }
        }

        Err(last_error
            .unwrap_or_else(|| StorageError::Unavailable("no elasticsearch host configured".into())))
    }

    fn write_query(&self) -> Vec<(&'static str, &'static str)> {
        if self.refresh_writes {
            vec![("refresh", "wait_for")]
        } else {
            Vec::new()
        }
    }
}

#[async_trait]
impl SearchBackend for HttpSearchClient {
    async fn ping(&self) -> StorageResult<()> {
        let resp = self.send(Method::GET, &[], &[], None).await?;
        if !resp.status().is_success() {
            return Err(error_from_response("ping", resp).await);
        }
        Ok(())
    }

    async fn index_exists(&self, index: &str) -> StorageResult<bool> {
        let resp = self.send(Method::HEAD, &[index], &[], None).await?;
        match resp.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(error_from_response("index exists", resp).await),
        }
    }

    async fn create_index(&self, index: &str, mapping: &Value) -> StorageResult<bool> {
        let resp = self.send(Method::PUT, &[index], &[], Some(mapping)).await?;
        if resp.status().is_success() {
            return Ok(true);
        }

        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if status == StatusCode::BAD_REQUEST
            && body["error"]["type"] == "resource_already_exists_exception"
        {
            debug!(index, "index created concurrently");
            return Ok(false);
        }
        Err(StorageError::Backend(format!(
            "create index {}: HTTP {} - {}",
            index, status, body
        )))
    }

    async fn index_document(&self, index: &str, id: &str, body: &Value) -> StorageResult<()> {
        let query = self.write_query();
        let resp = self
            .send(Method::PUT, &[index, "_doc", id], &query, Some(body))
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response("index document", resp).await);
        }
        Ok(())
    }

    async fn get_document(&self, index: &str, id: &str) -> StorageResult<Option<Value>> {
        let resp = self.send(Method::GET, &[index, "_doc", id], &[], None).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let doc: GetResponse = resp.json().await.map_err(transport_error)?;
                Ok(if doc.found { doc.source } else { None })
            }
            _ => Err(error_from_response("get document", resp).await),
        }
    }

    async fn update_document(&self, index: &str, id: &str, partial: &Value) -> StorageResult<bool> {
        let query = self.write_query();
        let body = json!({ "doc": partial });
        let resp = self
            .send(Method::POST, &[index, "_update", id], &query, Some(&body))
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            _ => Err(error_from_response("update document", resp).await),
        }
    }

    async fn delete_document(&self, index: &str, id: &str) -> StorageResult<bool> {
        let resp = self
            .send(Method::DELETE, &[index, "_doc", id], &[("refresh", "true")], None)
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            _ => Err(error_from_response("delete document", resp).await),
        }
    }

    async fn search(&self, index: &str, request: &SearchRequest) -> StorageResult<SearchHits> {
        let body = request.to_body();
        let resp = self
            .send(Method::POST, &[index, "_search"], &[], Some(&body))
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response("search", resp).await);
        }

        let parsed: SearchResponse = resp.json().await.map_err(transport_error)?;
        Ok(SearchHits {
            total: parsed.hits.total.value,
            hits: parsed
                .hits
                .hits
                .into_iter()
                .map(|hit| Hit {
                    id: hit.id,
                    source: hit.source,
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(hosts: &[&str]) -> HttpSearchConfig {
        HttpSearchConfig {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            username: None,
            password: None,
            timeout: Duration::from_secs(1),
            refresh_writes: false,
        }
    }

    #[test]
    fn test_requires_a_host() {
        assert!(matches!(
            HttpSearchClient::new(config(&[])),
            Err(StorageError::Config(_))
        ));
        assert!(matches!(
            HttpSearchClient::new(config(&["not a url"])),
            Err(StorageError::Config(_))
        ));
    }

    #[test]
    fn test_url_encodes_document_ids() {
        let host = Url::parse("http://localhost:9200/").unwrap();
        let url = HttpSearchClient::url(&host, &["persona", "_doc", "k\u{1f}v 1"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:9200/persona/_doc/k%1Fv%201");
    }

    #[test]
    fn test_status_mapping() {
        assert!(status_error("search", StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(status_error("search", StatusCode::SERVICE_UNAVAILABLE, "").is_retryable());
        assert!(matches!(
            status_error("index", StatusCode::BAD_REQUEST, "mapper_parsing_exception"),
            StorageError::Backend(_)
        ));
    }

    #[test]
    fn test_search_response_parsing() {
        let raw = serde_json::json!({
            "took": 1,
            "hits": {
                "total": {"value": 1500, "relation": "eq"},
                "hits": [{"_id": "a", "_source": {"key": "a", "value": "1"}}]
            }
        });
        let parsed: SearchResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.hits.total.value, 1500);
        assert_eq!(parsed.hits.hits[0].id, "a");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_unavailable() {
        let client = HttpSearchClient::new(config(&["http://127.0.0.1:1"])).unwrap();
        assert!(matches!(
            client.ping().await,
            Err(StorageError::Unavailable(_))
        ));
    }
}
