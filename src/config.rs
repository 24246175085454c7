//! Configuration module for the access-stream service.
//!
//! This module loads every tunable from `ACCESS_STREAM_*` environment
//! variables into a single [`Config`] value which is then passed by
//! reference into each component's constructor.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::tailer::ReadMode;

/// Default input file (nginx JSON access log)
const DEFAULT_INPUT: &str = "/var/log/nginx/access.json";

/// Default Elasticsearch cluster address
const DEFAULT_ELASTIC_URL: &str = "http://localhost:9200";

/// Default number of records per bulk request
const DEFAULT_CHUNK_SIZE: usize = 500;

/// Default maximum age of a non-empty chunk, in seconds
const DEFAULT_MAX_DELAY_SECS: u64 = 10;

/// Default number of retries for rate-limited documents
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default Elasticsearch request timeout, in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default strftime pattern for index names
const DEFAULT_INDEX_PATTERN: &str = "nginx-%Y.%m.%d";

/// Default index template name
const DEFAULT_TEMPLATE_NAME: &str = "nginx";

/// Default carbon plaintext port
pub const DEFAULT_CARBON_PORT: u16 = 2003;

/// Default statistics window width, in seconds
const DEFAULT_CARBON_INTERVAL_SECS: u64 = 10;

/// GeoIP database tried when none is configured
pub const DEFAULT_GEOIP_PATH: &str = "/usr/share/GeoIP/GeoLite2-City.mmdb";

/// Maximum allowed chunk size to prevent memory issues
const MAX_CHUNK_SIZE: usize = 10_000;

/// Configuration of the windowed statistics aggregator.
#[derive(Debug, Clone)]
pub struct CarbonConfig {
    /// Carbon host name or address
    pub host: String,

    /// Carbon plaintext port
    pub port: u16,

    /// Send over UDP instead of TCP
    pub use_udp: bool,

    /// Window width in seconds
    pub interval: u64,

    /// How long a window waits after its end and after its last record
    pub delay: Duration,

    /// Dotted metric name prefix
    pub prefix: String,
}

/// Configuration for the access-stream service.
#[derive(Debug, Clone)]
pub struct Config {
    /// Input file path, `-` for standard input
    pub input: String,

    /// How the input file is read
    pub mode: ReadMode,

    /// Whether `mode` was set explicitly rather than defaulted
    pub mode_explicit: bool,

    /// Elasticsearch cluster URLs, tried in rotation
    pub elastic_urls: Vec<String>,

    /// HTTP request timeout duration
    pub request_timeout: Duration,

    /// Number of records to accumulate before sending a bulk request
    pub chunk_size: usize,

    /// Maximum time a non-empty chunk may wait before it is flushed
    pub max_delay: Duration,

    /// Maximum number of retries for rate-limited documents
    pub max_retries: u32,

    /// Records older than this are skipped
    pub min_timestamp: Option<DateTime<Utc>>,

    /// Records newer than this are skipped
    pub max_timestamp: Option<DateTime<Utc>>,

    /// strftime pattern producing the index name from a record timestamp
    pub index_pattern: String,

    /// Optional index template file, the built-in template is used otherwise
    pub template_path: Option<PathBuf>,

    /// Index template name
    pub template_name: String,

    /// Recreate the template even when it already exists
    pub force_template: bool,

    /// Host name added to every document
    pub hostname: String,

    /// GeoIP City database used to enrich client addresses
    pub geoip_path: PathBuf,

    /// Whether `geoip_path` was configured; only then is a load failure fatal
    pub geoip_explicit: bool,

    /// Statistics aggregator settings, `None` disables it
    pub carbon: Option<CarbonConfig>,

    /// Write documents and metrics to stdout instead of the network
    pub stdout: bool,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl ConfigError {
    fn for_var(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Returns a new `Config` instance with values from environment variables,
    /// falling back to defaults where a variable is unset.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when a variable is set but malformed or out of
    /// range, or when the index pattern contains an invalid specifier.
    pub fn from_env() -> Result<Self, ConfigError> {
        let input = env::var("ACCESS_STREAM_INPUT").unwrap_or_else(|_| DEFAULT_INPUT.to_string());

        let (mode, mode_explicit) = match env::var("ACCESS_STREAM_MODE") {
            Ok(value) => {
                let mode = value
                    .parse::<ReadMode>()
                    .map_err(|e| ConfigError::for_var("ACCESS_STREAM_MODE", e))?;
                (mode, true)
            }
            Err(_) => (ReadMode::Tail, false),
        };

        let elastic_urls = Self::parse_elastic_urls()?;

        let request_timeout =
            Duration::from_secs(parse_var("ACCESS_STREAM_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?);

        let chunk_size = Self::parse_chunk_size()?;

        let max_delay_secs: u64 = parse_var("ACCESS_STREAM_MAX_DELAY_SECS", DEFAULT_MAX_DELAY_SECS)?;
        if max_delay_secs == 0 {
            return Err(ConfigError::for_var(
                "ACCESS_STREAM_MAX_DELAY_SECS",
                "max delay must be greater than 0",
            ));
        }

        let max_retries = parse_var("ACCESS_STREAM_MAX_RETRIES", DEFAULT_MAX_RETRIES)?;

        let min_timestamp = parse_timestamp_var("ACCESS_STREAM_MIN_TIMESTAMP")?;
        let max_timestamp = parse_timestamp_var("ACCESS_STREAM_MAX_TIMESTAMP")?;

        let index_pattern = env::var("ACCESS_STREAM_INDEX")
            .unwrap_or_else(|_| DEFAULT_INDEX_PATTERN.to_string());
        validate_index_pattern(&index_pattern)
            .map_err(|e| ConfigError::for_var("ACCESS_STREAM_INDEX", e))?;

        let hostname = env::var("ACCESS_STREAM_HOSTNAME").unwrap_or_else(|_| local_hostname());

        let (geoip_path, geoip_explicit) = match env::var("ACCESS_STREAM_GEOIP") {
            Ok(path) if !path.trim().is_empty() => (PathBuf::from(path.trim()), true),
            _ => (PathBuf::from(DEFAULT_GEOIP_PATH), false),
        };

        let carbon = Self::parse_carbon(&hostname)?;

        Ok(Self {
            input,
            mode,
            mode_explicit,
            elastic_urls,
            request_timeout,
            chunk_size,
            max_delay: Duration::from_secs(max_delay_secs),
            max_retries,
            min_timestamp,
            max_timestamp,
            index_pattern,
            template_path: env::var("ACCESS_STREAM_TEMPLATE").ok().map(PathBuf::from),
            template_name: env::var("ACCESS_STREAM_TEMPLATE_NAME")
                .unwrap_or_else(|_| DEFAULT_TEMPLATE_NAME.to_string()),
            force_template: parse_var("ACCESS_STREAM_FORCE_TEMPLATE", false)?,
            hostname,
            geoip_path,
            geoip_explicit,
            carbon,
            stdout: parse_var("ACCESS_STREAM_STDOUT", false)?,
        })
    }

    fn parse_elastic_urls() -> Result<Vec<String>, ConfigError> {
        let raw = env::var("ACCESS_STREAM_ELASTIC").unwrap_or_else(|_| DEFAULT_ELASTIC_URL.to_string());

        let urls: Vec<String> = raw
            .split(',')
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .collect();

        if urls.is_empty() {
            return Err(ConfigError::for_var(
                "ACCESS_STREAM_ELASTIC",
                "at least one cluster URL is required",
            ));
        }

        Ok(urls)
    }

    /// Parse chunk size from environment variable with validation.
    fn parse_chunk_size() -> Result<usize, ConfigError> {
        let env_var = "ACCESS_STREAM_CHUNK_SIZE";
        let chunk_size: usize = parse_var(env_var, DEFAULT_CHUNK_SIZE)?;

        if chunk_size == 0 {
            return Err(ConfigError::for_var(env_var, "chunk size must be greater than 0"));
        }

        if chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::for_var(
                env_var,
                format!(
                    "chunk size {} exceeds maximum allowed ({})",
                    chunk_size, MAX_CHUNK_SIZE
                ),
            ));
        }

        Ok(chunk_size)
    }

    fn parse_carbon(hostname: &str) -> Result<Option<CarbonConfig>, ConfigError> {
        let env_var = "ACCESS_STREAM_CARBON";
        let address = match env::var(env_var) {
            Ok(address) if !address.trim().is_empty() => address,
            _ => return Ok(None),
        };

        let (host, port) = parse_host_port(address.trim())
            .map_err(|e| ConfigError::for_var(env_var, e))?;

        let interval: u64 = parse_var("ACCESS_STREAM_CARBON_INTERVAL_SECS", DEFAULT_CARBON_INTERVAL_SECS)?;
        if interval == 0 {
            return Err(ConfigError::for_var(
                "ACCESS_STREAM_CARBON_INTERVAL_SECS",
                "interval must be greater than 0",
            ));
        }

        let delay: u64 = parse_var("ACCESS_STREAM_CARBON_DELAY_SECS", interval)?;

        let prefix = env::var("ACCESS_STREAM_CARBON_PREFIX")
            .unwrap_or_else(|_| default_prefix(hostname));

        Ok(Some(CarbonConfig {
            host,
            port,
            use_udp: parse_var("ACCESS_STREAM_CARBON_UDP", false)?,
            interval,
            delay: Duration::from_secs(delay),
            prefix,
        }))
    }
}

impl Default for Config {
    /// Create a default configuration using default values.
    ///
    /// This is useful for testing or when environment variables are not set.
    fn default() -> Self {
        Self {
            input: DEFAULT_INPUT.to_string(),
            mode: ReadMode::Tail,
            mode_explicit: false,
            elastic_urls: vec![DEFAULT_ELASTIC_URL.to_string()],
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            min_timestamp: None,
            max_timestamp: None,
            index_pattern: DEFAULT_INDEX_PATTERN.to_string(),
            template_path: None,
            template_name: DEFAULT_TEMPLATE_NAME.to_string(),
            force_template: false,
            hostname: "localhost".to_string(),
            geoip_path: PathBuf::from(DEFAULT_GEOIP_PATH),
            geoip_explicit: false,
            carbon: None,
            stdout: false,
        }
    }
}

/// Parse an optional environment variable, falling back to `default` when unset.
fn parse_var<T: std::str::FromStr>(env_var: &str, default: T) -> Result<T, ConfigError> {
    match env::var(env_var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::for_var(env_var, format!("'{}' is not a valid value", value))),
        Err(_) => Ok(default),
    }
}

fn parse_timestamp_var(env_var: &str) -> Result<Option<DateTime<Utc>>, ConfigError> {
    match env::var(env_var) {
        Ok(value) => parse_timestamp(&value)
            .map(Some)
            .ok_or_else(|| ConfigError::for_var(env_var, format!("'{}' is not a valid timestamp", value))),
        Err(_) => Ok(None),
    }
}

/// Parse a replay bound. Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` and
/// `YYYY-MM-DD`; the last two are taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Reject index patterns chrono cannot format, so the hot path never sees one.
pub fn validate_index_pattern(pattern: &str) -> Result<(), String> {
    if pattern.is_empty() {
        return Err("index pattern must not be empty".to_string());
    }
    if StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error)) {
        return Err(format!("'{}' is not a valid strftime pattern", pattern));
    }
    Ok(())
}

/// Split `host[:port]`, defaulting to the carbon plaintext port.
pub fn parse_host_port(address: &str) -> Result<(String, u16), String> {
    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') || host.starts_with('[') => {
            let port = port
                .parse::<u16>()
                .map_err(|_| format!("'{}' is not a valid port", port))?;
            let host = host.trim_start_matches('[').trim_end_matches(']');
            if host.is_empty() {
                return Err("carbon host must not be empty".to_string());
            }
            Ok((host.to_string(), port))
        }
        _ => Ok((address.to_string(), DEFAULT_CARBON_PORT)),
    }
}

fn default_prefix(hostname: &str) -> String {
    format!("access_stream.{}", hostname.replace('.', "_"))
}

fn local_hostname() -> String {
    env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}
