//! Access log record model and the line-to-record source.
//!
//! A [`Record`] is one parsed nginx JSON access log entry. The typed fields
//! are the ones the statistics aggregator and the bulk pipeline need; every
//! other field of the log line is preserved in `extra` and indexed as is.

use chrono::{DateTime, FixedOffset};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A single parsed access log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Request completion time
    #[serde(rename = "@timestamp")]
    pub timestamp: DateTime<FixedOffset>,

    /// Virtual host that served the request
    #[serde(default)]
    pub host: String,

    /// First path segment of the request URI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_path_1: Option<String>,

    /// Second path segment of the request URI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_path_2: Option<String>,

    /// HTTP status, 0 for stream (TCP passthrough) sessions
    #[serde(default, deserialize_with = "status_code")]
    pub status: u16,

    /// Total request duration in seconds
    #[serde(default)]
    pub request_time: f64,

    /// Upstream response durations in seconds, one per upstream attempt
    #[serde(
        default,
        deserialize_with = "upstream_times",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub upstream_response_time: Vec<f64>,

    /// Bytes sent to the client
    #[serde(default)]
    pub bytes_sent: u64,

    /// nginx `$upstream_cache_status`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_cache_status: Option<String>,

    /// All other fields of the log line
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Record {
    /// Create a record with only a timestamp and status set.
    pub fn new(timestamp: DateTime<FixedOffset>, status: u16) -> Self {
        Self {
            timestamp,
            host: String::new(),
            request_path_1: None,
            request_path_2: None,
            status,
            request_time: 0.0,
            upstream_response_time: Vec::new(),
            bytes_sent: 0,
            upstream_cache_status: None,
            extra: serde_json::Map::new(),
        }
    }

    /// The last upstream attempt's duration, if any upstream was involved.
    pub fn last_upstream_time(&self) -> Option<f64> {
        self.upstream_response_time.last().copied()
    }
}

/// Turns one raw log line into a structured record.
///
/// `None` means the line is unparseable and should be skipped.
pub trait RecordSource: Send {
    fn parse(&self, line: &str) -> Option<Record>;
}

/// A post-processing step applied to every parsed record, in order.
pub trait RecordTransform: Send + Sync {
    fn transform(&self, record: Record) -> Record;
}

/// Adds the shipping host's name to every document.
#[derive(Debug, Clone)]
pub struct HostnameTransform {
    hostname: String,
}

impl HostnameTransform {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }
}

impl RecordTransform for HostnameTransform {
    fn transform(&self, mut record: Record) -> Record {
        record.extra.insert(
            "hostname".to_string(),
            serde_json::Value::String(self.hostname.clone()),
        );
        record
    }
}

/// Record source for nginx `escape=json` access logs.
#[derive(Default)]
pub struct JsonRecordSource {
    transforms: Vec<Box<dyn RecordTransform>>,
}

impl JsonRecordSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a transform to the end of the chain.
    pub fn with_transform(mut self, transform: impl RecordTransform + 'static) -> Self {
        self.transforms.push(Box::new(transform));
        self
    }
}

impl RecordSource for JsonRecordSource {
    fn parse(&self, line: &str) -> Option<Record> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let mut record: Record = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) => {
                debug!(error = %e, "Skipping unparseable line");
                return None;
            }
        };

        if record.request_path_1.is_none() && record.request_path_2.is_none() {
            let uri = record
                .extra
                .get("request_uri")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            if let Some(uri) = uri {
                let (first, second) = split_request_path(&uri);
                record.request_path_1 = first;
                record.request_path_2 = second;
            }
        }

        Some(
            self.transforms
                .iter()
                .fold(record, |record, t| t.transform(record)),
        )
    }
}

/// First two non-empty segments of a request URI, query string excluded.
pub fn split_request_path(uri: &str) -> (Option<String>, Option<String>) {
    let path = uri.split(['?', '#']).next().unwrap_or_default();
    let mut segments = path.split('/').filter(|s| !s.is_empty()).map(str::to_string);
    (segments.next(), segments.next())
}

fn status_code<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Status {
        Number(u16),
        Text(String),
    }

    match Status::deserialize(deserializer)? {
        Status::Number(n) => Ok(n),
        Status::Text(s) if s.is_empty() || s == "-" => Ok(0),
        Status::Text(s) => s.parse().map_err(de::Error::custom),
    }
}

/// nginx reports one time per upstream attempt: `"0.010, 0.020 : 0.030"`.
/// Attempts that got no response are logged as `-` and skipped.
fn upstream_times<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Times {
        One(f64),
        Many(Vec<f64>),
        Text(String),
        Null(()),
    }

    Ok(match Times::deserialize(deserializer)? {
        Times::One(t) => vec![t],
        Times::Many(ts) => ts,
        Times::Text(s) => s
            .split([',', ':'])
            .filter_map(|part| part.trim().parse::<f64>().ok())
            .collect(),
        Times::Null(()) => Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: &str = r#"{"@timestamp":"2024-03-01T12:00:05.250+00:00","host":"api.example.com","request_uri":"/users/42?full=1","status":"200","request_time":0.123,"upstream_response_time":"0.050, 0.070","bytes_sent":512,"remote_addr":"10.0.0.1"}"#;

    #[test]
    fn test_parse_full_line() {
        let source = JsonRecordSource::new();
        let record = source.parse(LINE).expect("line should parse");

        assert_eq!(record.host, "api.example.com");
        assert_eq!(record.status, 200);
        assert_eq!(record.request_path_1.as_deref(), Some("users"));
        assert_eq!(record.request_path_2.as_deref(), Some("42"));
        assert_eq!(record.upstream_response_time, vec![0.050, 0.070]);
        assert_eq!(record.last_upstream_time(), Some(0.070));
        assert_eq!(record.bytes_sent, 512);
        assert!(record.upstream_cache_status.is_none());
        assert_eq!(record.extra["remote_addr"], "10.0.0.1");
        assert_eq!(record.timestamp.timestamp_millis(), 1_709_294_405_250);
    }

    #[test]
    fn test_stream_session_has_zero_status() {
        let source = JsonRecordSource::new();
        let record = source
            .parse(r#"{"@timestamp":"2024-03-01T12:00:05+00:00","bytes_sent":10}"#)
            .unwrap();
        assert_eq!(record.status, 0);
    }

    #[test]
    fn test_unparseable_lines_are_skipped() {
        let source = JsonRecordSource::new();
        assert!(source.parse("").is_none());
        assert!(source.parse("GET / HTTP/1.1").is_none());
        assert!(source.parse(r#"{"host":"no timestamp"}"#).is_none());
    }

    #[test]
    fn test_upstream_time_variants() {
        let source = JsonRecordSource::new();
        let parse = |upstream: &str| {
            let line = format!(
                r#"{{"@timestamp":"2024-03-01T12:00:05+00:00","upstream_response_time":{}}}"#,
                upstream
            );
            source.parse(&line).unwrap().upstream_response_time
        };

        assert_eq!(parse("0.5"), vec![0.5]);
        assert_eq!(parse("[0.1, 0.2]"), vec![0.1, 0.2]);
        assert_eq!(parse(r#""-, 0.3 : 0.4""#), vec![0.3, 0.4]);
        assert_eq!(parse(r#""-""#), Vec::<f64>::new());
        assert_eq!(parse("null"), Vec::<f64>::new());
    }

    #[test]
    fn test_hostname_transform() {
        let source = JsonRecordSource::new().with_transform(HostnameTransform::new("web1"));
        let record = source.parse(LINE).unwrap();
        assert_eq!(record.extra["hostname"], "web1");
    }

    #[test]
    fn test_document_serialization() {
        let record = JsonRecordSource::new().parse(LINE).unwrap();
        let doc = serde_json::to_value(&record).unwrap();

        assert_eq!(doc["@timestamp"], "2024-03-01T12:00:05.250+00:00");
        assert_eq!(doc["status"], 200);
        assert_eq!(doc["request_path_1"], "users");
        assert_eq!(doc["remote_addr"], "10.0.0.1");
        assert!(doc.get("upstream_cache_status").is_none());
    }

    #[test]
    fn test_split_request_path() {
        assert_eq!(
            split_request_path("/a/b/c?x=1"),
            (Some("a".to_string()), Some("b".to_string()))
        );
        assert_eq!(split_request_path("/a"), (Some("a".to_string()), None));
        assert_eq!(split_request_path("/?q=1"), (None, None));
    }
}
