//! Elasticsearch client module.
//!
//! This module provides the bulk indexing contract used by the pipeline
//! ([`BulkIndexer`]) and its HTTP implementation ([`EsClient`]) on top of a
//! pooled reqwest client, plus the one-time index template check.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::record::Record;

/// One document of a bulk request together with its destination index.
#[derive(Debug, Clone)]
pub struct BulkItem {
    pub index: String,
    pub record: Record,
}

/// Per-document result of a bulk request.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// The document was written
    Indexed,
    /// The cluster asked for the document to be resent later (HTTP 429)
    RateLimited,
    /// The document was refused for any other reason
    Failed { status: u16, reason: String },
}

/// Errors that can occur during HTTP client operations.
#[derive(Debug)]
pub enum ClientError {
    /// HTTP request failed
    Request(reqwest::Error),

    /// Server returned an error status code
    Status {
        code: StatusCode,
        message: String,
    },

    /// Failed to parse response body
    Parse(String),

    /// Request timeout
    Timeout,

    /// Client configuration error
    Config(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Request(e) => write!(f, "HTTP request failed: {}", e),
            ClientError::Status { code, message } => {
                write!(f, "Server error ({}): {}", code, message)
            }
            ClientError::Parse(e) => write!(f, "Failed to parse response: {}", e),
            ClientError::Timeout => write!(f, "Request timed out"),
            ClientError::Config(e) => write!(f, "Client configuration error: {}", e),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Request(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::Request(err)
        }
    }
}

impl ClientError {
    /// Whether the error says nothing about the document, only the connection.
    fn is_transport(&self) -> bool {
        match self {
            ClientError::Request(e) => e.is_connect() || e.is_request(),
            ClientError::Timeout => true,
            _ => false,
        }
    }
}

/// Writes a batch of documents with a single request.
///
/// Implementations return one outcome per item, in request order. An `Err`
/// means the request as a whole failed and no per-item result is known.
#[async_trait]
pub trait BulkIndexer: Send + Sync {
    async fn bulk(&self, items: &[BulkItem]) -> Result<Vec<ItemOutcome>, ClientError>;
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<std::collections::HashMap<String, BulkItemResponse>>,
}

#[derive(Debug, Deserialize)]
struct BulkItemResponse {
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

/// HTTP client for an Elasticsearch cluster.
///
/// The client uses connection pooling (via reqwest's internal pool) and
/// moves on to the next configured cluster URL after a transport error.
pub struct EsClient {
    /// The underlying HTTP client (reused for connection pooling)
    client: Client,

    /// Cluster base URLs without trailing slash
    urls: Vec<String>,

    /// Index into `urls` used for the next request
    current: AtomicUsize,

    /// Request timeout duration
    timeout: Duration,
}

impl EsClient {
    /// Create a new client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, ClientError> {
        Self::with_settings(config.elastic_urls.clone(), config.request_timeout)
    }

    /// Create a new client with custom settings.
    pub fn with_settings(urls: Vec<String>, timeout: Duration) -> Result<Self, ClientError> {
        if urls.is_empty() {
            return Err(ClientError::Config("no cluster URL configured".to_string()));
        }

        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        Ok(Self {
            client,
            urls,
            current: AtomicUsize::new(0),
            timeout,
        })
    }

    /// The cluster URL the next request goes to.
    pub fn base_url(&self) -> &str {
        &self.urls[self.current.load(Ordering::Relaxed) % self.urls.len()]
    }

    fn rotate_on(&self, err: &ClientError) {
        if err.is_transport() && self.urls.len() > 1 {
            let next = self.current.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            warn!(
                error = %err,
                next_url = %self.urls[next % self.urls.len()],
                "Cluster unreachable, switching node"
            );
        }
    }

    /// Whether an index template with this name exists.
    pub async fn template_exists(&self, name: &str) -> Result<bool, ClientError> {
        let url = format!("{}/_template/{}", self.base_url(), name);
        let response = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(ClientError::from)
            .inspect_err(|e| self.rotate_on(e))?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            code => Err(ClientError::Status {
                code,
                message: "unexpected template lookup status".to_string(),
            }),
        }
    }

    /// Create or replace an index template.
    pub async fn put_template(&self, name: &str, template: &Value) -> Result<(), ClientError> {
        let url = format!("{}/_template/{}", self.base_url(), name);
        let response = self
            .client
            .put(&url)
            .json(template)
            .send()
            .await
            .map_err(ClientError::from)
            .inspect_err(|e| self.rotate_on(e))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            Err(ClientError::Status {
                code: status,
                message,
            })
        }
    }

    /// Make sure the index template exists, creating it when missing or
    /// when `force` is set. Called once at startup.
    pub async fn ensure_template(
        &self,
        name: &str,
        template: &Value,
        force: bool,
    ) -> Result<(), ClientError> {
        if !force && self.template_exists(name).await? {
            debug!(template = name, "Index template present");
            return Ok(());
        }

        self.put_template(name, template).await?;
        info!(template = name, "Index template created");
        Ok(())
    }
}

#[async_trait]
impl BulkIndexer for EsClient {
    async fn bulk(&self, items: &[BulkItem]) -> Result<Vec<ItemOutcome>, ClientError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let body = build_bulk_body(items)?;
        let url = format!("{}/_bulk", self.base_url());

        debug!(documents = items.len(), url = %url, "Sending bulk request");

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/x-ndjson")
            .timeout(self.timeout)
            .body(body)
            .send()
            .await
            .map_err(ClientError::from)
            .inspect_err(|e| self.rotate_on(e))?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Ok(vec![ItemOutcome::RateLimited; items.len()]);
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::Status {
                code: status,
                message,
            });
        }

        let text = response.text().await?;
        parse_bulk_response(&text, items.len())
    }
}

/// Build an NDJSON bulk body: an action line and a document line per item.
pub fn build_bulk_body(items: &[BulkItem]) -> Result<String, ClientError> {
    let mut body = String::new();

    for item in items {
        let action = json!({ "index": { "_index": item.index } });
        body.push_str(&action.to_string());
        body.push('\n');

        let doc = serde_json::to_string(&item.record).map_err(|e| ClientError::Parse(e.to_string()))?;
        body.push_str(&doc);
        body.push('\n');
    }

    Ok(body)
}

/// Map a bulk response body onto per-item outcomes.
pub fn parse_bulk_response(text: &str, expected: usize) -> Result<Vec<ItemOutcome>, ClientError> {
    let response: BulkResponse =
        serde_json::from_str(text).map_err(|e| ClientError::Parse(e.to_string()))?;

    if !response.errors && response.items.is_empty() {
        return Ok(vec![ItemOutcome::Indexed; expected]);
    }

    if response.items.len() != expected {
        return Err(ClientError::Parse(format!(
            "bulk response has {} items, request had {}",
            response.items.len(),
            expected
        )));
    }

    let outcomes = response
        .items
        .into_iter()
        .map(|item| {
            let Some(result) = item.into_values().next() else {
                return ItemOutcome::Failed {
                    status: 0,
                    reason: "empty item in bulk response".to_string(),
                };
            };
            match result.status {
                200..=299 => ItemOutcome::Indexed,
                429 => ItemOutcome::RateLimited,
                status => ItemOutcome::Failed {
                    status,
                    reason: result
                        .error
                        .map(|e| error_reason(&e))
                        .unwrap_or_else(|| "unknown error".to_string()),
                },
            }
        })
        .collect();

    Ok(outcomes)
}

fn error_reason(error: &Value) -> String {
    match (error.get("type"), error.get("reason")) {
        (Some(t), Some(r)) => format!(
            "{}: {}",
            t.as_str().unwrap_or_default(),
            r.as_str().unwrap_or_default()
        ),
        _ => error.to_string(),
    }
}

/// The built-in index template for access log indices created from
/// `index_pattern`.
pub fn default_template(index_pattern: &str) -> Value {
    let prefix = index_pattern.split('%').next().unwrap_or_default();

    json!({
        "index_patterns": [format!("{}*", prefix)],
        "settings": {
            "number_of_shards": 1,
            "refresh_interval": "10s"
        },
        "mappings": {
            "dynamic_templates": [{
                "strings_as_keywords": {
                    "match_mapping_type": "string",
                    "mapping": { "type": "keyword", "ignore_above": 1024 }
                }
            }],
            "properties": {
                "@timestamp": { "type": "date" },
                "host": { "type": "keyword" },
                "hostname": { "type": "keyword" },
                "request_path_1": { "type": "keyword" },
                "request_path_2": { "type": "keyword" },
                "request_uri": { "type": "keyword" },
                "status": { "type": "short" },
                "request_time": { "type": "float" },
                "upstream_response_time": { "type": "float" },
                "upstream_cache_status": { "type": "keyword" },
                "bytes_sent": { "type": "long" },
                "remote_addr": { "type": "ip" },
                "geoip": {
                    "properties": {
                        "location": { "type": "geo_point" }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn item(index: &str) -> BulkItem {
        let ts = DateTime::parse_from_rfc3339("2024-03-01T12:00:00+00:00").unwrap();
        BulkItem {
            index: index.to_string(),
            record: Record::new(ts, 200),
        }
    }

    #[test]
    fn test_client_error_display() {
        let err = ClientError::Timeout;
        assert_eq!(format!("{}", err), "Request timed out");

        let err = ClientError::Status {
            code: StatusCode::BAD_REQUEST,
            message: "Invalid JSON".to_string(),
        };
        assert!(format!("{}", err).contains("400"));
        assert!(format!("{}", err).contains("Invalid JSON"));
    }

    #[test]
    fn test_client_creation() {
        let config = Config::default();
        let client = EsClient::new(&config).expect("client should build");
        assert_eq!(client.base_url(), "http://localhost:9200");
        assert_eq!(client.timeout, Duration::from_secs(30));

        assert!(matches!(
            EsClient::with_settings(Vec::new(), Duration::from_secs(1)),
            Err(ClientError::Config(_))
        ));
    }

    #[test]
    fn test_bulk_body_targets_each_items_index() {
        let body = build_bulk_body(&[item("nginx-2024.03.01"), item("nginx-2024.03.02")]).unwrap();
        let lines: Vec<&str> = body.lines().collect();

        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], r#"{"index":{"_index":"nginx-2024.03.01"}}"#);
        assert_eq!(lines[2], r#"{"index":{"_index":"nginx-2024.03.02"}}"#);
        let doc: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(doc["status"], 200);
        assert!(body.ends_with('\n'));
    }

    #[test]
    fn test_parse_bulk_response_mixed_outcomes() {
        let text = r#"{
            "took": 3,
            "errors": true,
            "items": [
                {"index": {"_index": "a", "status": 201}},
                {"index": {"_index": "a", "status": 429,
                    "error": {"type": "es_rejected_execution_exception", "reason": "queue full"}}},
                {"index": {"_index": "a", "status": 400,
                    "error": {"type": "mapper_parsing_exception", "reason": "bad field"}}}
            ]
        }"#;

        let outcomes = parse_bulk_response(text, 3).unwrap();
        assert_eq!(outcomes[0], ItemOutcome::Indexed);
        assert_eq!(outcomes[1], ItemOutcome::RateLimited);
        assert_eq!(
            outcomes[2],
            ItemOutcome::Failed {
                status: 400,
                reason: "mapper_parsing_exception: bad field".to_string()
            }
        );
    }

    #[test]
    fn test_parse_bulk_response_item_count_mismatch() {
        let text = r#"{"errors": true, "items": [{"index": {"status": 201}}]}"#;
        assert!(matches!(parse_bulk_response(text, 2), Err(ClientError::Parse(_))));
        assert!(matches!(parse_bulk_response("not json", 1), Err(ClientError::Parse(_))));
    }

    #[test]
    fn test_default_template_matches_index_pattern() {
        let template = default_template("nginx-%Y.%m.%d");
        assert_eq!(template["index_patterns"][0], "nginx-*");
        assert_eq!(template["mappings"]["properties"]["@timestamp"]["type"], "date");
    }
}
