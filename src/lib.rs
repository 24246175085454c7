//! Access Stream Library
//!
//! This library provides the components of the nginx access log streamer:
//!
//! - **config**: Environment-based configuration
//! - **record**: Access log record model and the JSON line parser
//! - **geoip**: Optional GeoIP enrichment of client addresses
//! - **tailer**: Rotation-aware file follower and stream input
//! - **client**: Elasticsearch bulk and template client
//! - **bulk**: Chunked bulk delivery with size and time flush triggers
//! - **output**: Local JSON-lines output for dry runs
//! - **stats**: Windowed traffic statistics
//! - **carbon**: Carbon plaintext metrics connection
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use access_stream::bulk::{run_pipeline, BulkConfig, BulkPipeline};
//! use access_stream::client::EsClient;
//! use access_stream::config::Config;
//! use access_stream::record::{JsonRecordSource, RecordSource};
//! use access_stream::tailer::LineInput;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let client = Arc::new(EsClient::new(&config).expect("Failed to create client"));
//!     let pipeline = BulkPipeline::new(client, BulkConfig::from(&config));
//!
//!     let (tx, rx) = tokio::sync::mpsc::channel(1000);
//!     let writer = tokio::spawn(run_pipeline(rx, pipeline));
//!
//!     let source = JsonRecordSource::new();
//!     let mut input = LineInput::open(&config.input, config.mode, false)
//!         .await
//!         .expect("Failed to open input");
//!     while let Some(line) = input.next_line().await {
//!         if let Some(record) = source.parse(&line) {
//!             tx.send(record).await.ok();
//!         }
//!     }
//!     drop(tx);
//!     writer.await.ok();
//! }
//! ```

// Module declarations
pub mod bulk;
pub mod carbon;
pub mod client;
pub mod config;
pub mod geoip;
pub mod output;
pub mod record;
pub mod stats;
pub mod tailer;

// Re-export commonly used types at crate root for convenience
pub use bulk::{BulkConfig, BulkError, BulkPipeline, BulkStats};
pub use carbon::{CarbonConnection, MetricsSink, WriterSink};
pub use client::{BulkIndexer, ClientError, EsClient, ItemOutcome};
pub use config::{CarbonConfig, Config, ConfigError};
pub use geoip::{GeoEnrichment, GeoError, GeoLookup};
pub use output::LocalOutput;
pub use record::{HostnameTransform, JsonRecordSource, Record, RecordSource, RecordTransform};
pub use stats::{Aggregator, AggregatorStats, Hit, StatsConfig};
pub use tailer::{LineInput, ReadMode, Tailer};
