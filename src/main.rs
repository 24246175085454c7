//! Access Stream - nginx access log streamer
//!
//! This service follows an nginx JSON access log, ships every record to
//! Elasticsearch in bulk, and optionally aggregates per-interval traffic
//! statistics for a carbon collector.
//!
//! ## Features
//!
//! - Rotation-aware file tailing, or one-shot replay of a file or pipe
//! - Size-based and time-based bulk flushing
//! - Retry of rate-limited documents with backoff
//! - Windowed request/upstream latency and traffic metrics
//! - Graceful shutdown on SIGINT
//!
//! ## Configuration
//!
//! Configuration is loaded from `ACCESS_STREAM_*` environment variables,
//! see [`access_stream::config`]. Frequently used:
//!
//! - `ACCESS_STREAM_INPUT`: Log file, `-` for stdin (default: /var/log/nginx/access.json)
//! - `ACCESS_STREAM_MODE`: `tail`, `from-start` or `one-shot` (default: tail)
//! - `ACCESS_STREAM_ELASTIC`: Comma-separated cluster URLs (default: http://localhost:9200)
//! - `ACCESS_STREAM_CARBON`: Carbon `host[:port]`, enables statistics
//! - `ACCESS_STREAM_STDOUT`: Write documents and metrics to stdout instead
//! - `ACCESS_STREAM_GEOIP`: GeoIP City database; a failure to load it is fatal
//! - `RUST_LOG`: Logging level filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use access_stream::bulk::{run_pipeline, BulkConfig, BulkPipeline, DEFAULT_CHANNEL_CAPACITY};
use access_stream::carbon::{CarbonConnection, MetricsSink, WriterSink};
use access_stream::client::{default_template, EsClient};
use access_stream::config::Config;
use access_stream::geoip::GeoEnrichment;
use access_stream::output::{run_local, LocalOutput};
use access_stream::record::{HostnameTransform, JsonRecordSource, Record, RecordSource};
use access_stream::stats::{run_aggregator, Aggregator, AggregatorStats, StatsConfig};
use access_stream::tailer::LineInput;

/// How long the writer task may take to flush after input stops
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between reader progress reports
const REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    info!("Starting access-stream...");

    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                input = %config.input,
                mode = %config.mode,
                elastic = ?config.elastic_urls,
                chunk_size = config.chunk_size,
                max_delay_secs = config.max_delay.as_secs(),
                max_retries = config.max_retries,
                index = %config.index_pattern,
                carbon = config.carbon.is_some(),
                stdout = config.stdout,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    // Decided once: a configured database must load, the default one may be absent
    let geoip = match GeoEnrichment::load(&config.geoip_path, config.geoip_explicit) {
        Ok(geoip) => geoip,
        Err(e) => {
            error!(error = %e, "Failed to load GeoIP database");
            std::process::exit(1);
        }
    };

    let mut input = match LineInput::open(&config.input, config.mode, config.mode_explicit).await {
        Ok(input) => input,
        Err(e) => {
            error!(input = %config.input, error = %e, "Failed to open input");
            std::process::exit(1);
        }
    };

    let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);

    // Spawn the writer task: bulk pipeline, or local output in stdout mode
    let writer_handle: JoinHandle<()> = if config.stdout {
        tokio::spawn(async move {
            info!("Local output started");
            run_local(rx, LocalOutput::new(tokio::io::stdout())).await;
        })
    } else {
        let client = match EsClient::new(&config) {
            Ok(client) => {
                info!(url = %client.base_url(), "Elasticsearch client initialized");
                Arc::new(client)
            }
            Err(e) => {
                error!(error = %e, "Failed to create Elasticsearch client");
                std::process::exit(1);
            }
        };

        let template = match load_template(&config).await {
            Ok(template) => template,
            Err(e) => {
                error!(error = %e, "Failed to load index template");
                std::process::exit(1);
            }
        };
        if let Err(e) = client
            .ensure_template(&config.template_name, &template, config.force_template)
            .await
        {
            error!(template = %config.template_name, error = %e, "Failed to set up index template");
            std::process::exit(1);
        }

        let pipeline = BulkPipeline::new(client, BulkConfig::from(&config));
        tokio::spawn(async move {
            info!("Bulk pipeline started");
            let stats = run_pipeline(rx, pipeline).await;
            info!(
                received = stats.records_received,
                skipped = stats.records_skipped,
                indexed = stats.records_indexed,
                failed = stats.records_failed,
                dropped = stats.records_dropped,
                retries = stats.retries,
                size_flushes = stats.size_flushes,
                time_flushes = stats.time_flushes,
                "Bulk pipeline completed"
            );
        })
    };

    // Spawn the statistics aggregator when a collector is configured
    let cancel = CancellationToken::new();
    let aggregator = config.carbon.as_ref().map(|carbon| {
        let aggregator = Arc::new(Aggregator::new(StatsConfig::from(carbon)));
        let sink: Box<dyn MetricsSink> = if config.stdout {
            Box::new(WriterSink::new(tokio::io::stdout()))
        } else {
            Box::new(CarbonConnection::new(carbon.host.clone(), carbon.port, carbon.use_udp))
        };
        info!(
            interval_secs = carbon.interval,
            delay_secs = carbon.delay.as_secs(),
            prefix = %carbon.prefix,
            "Statistics aggregator started"
        );
        let handle = tokio::spawn(run_aggregator(aggregator.clone(), sink, cancel.clone()));
        (aggregator, handle)
    });

    // Build the record source with its transform chain
    let source = JsonRecordSource::new()
        .with_transform(HostnameTransform::new(config.hostname.clone()))
        .with_transform(geoip);
    let stats_target = aggregator.as_ref().map(|(aggregator, _)| aggregator.clone());

    let mut reader_handle = tokio::spawn(async move {
        info!("Reader task started");
        run_reader(&mut input, &source, stats_target.as_deref(), tx).await;
        info!("Reader task completed");
    });

    // Wait for shutdown signal or the end of input
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Shutdown signal received, stopping..."),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
            // Dropping the reader drops the channel sender
            reader_handle.abort();
        }
        _ = &mut reader_handle => {
            info!("Input exhausted");
        }
    }

    // Graceful shutdown
    info!("Initiating graceful shutdown...");

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, writer_handle).await {
        Ok(Ok(())) => info!("Writer task shut down gracefully"),
        Ok(Err(e)) => warn!(error = %e, "Writer task panicked during shutdown"),
        Err(_) => warn!("Writer task shutdown timed out after {:?}", SHUTDOWN_TIMEOUT),
    }

    if let Some((_, handle)) = aggregator {
        cancel.cancel();
        match handle.await {
            Ok(stats) => log_aggregator_stats(&stats),
            Err(e) => warn!(error = %e, "Aggregator task panicked during shutdown"),
        }
    }

    info!("access-stream stopped");
}

/// Initialize the tracing subscriber with environment-based filtering.
///
/// Logs go to stderr so stdout stays clean for local output mode.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Read the configured template file, or build the default template.
async fn load_template(config: &Config) -> Result<Value, String> {
    match &config.template_path {
        Some(path) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| format!("{}: {}", path.display(), e))?;
            serde_json::from_str(&text).map_err(|e| format!("{}: {}", path.display(), e))
        }
        None => Ok(default_template(&config.index_pattern)),
    }
}

/// Feed parsed records to the statistics and the writer channel until the
/// input ends or the channel closes.
async fn run_reader<S: RecordSource + Sync>(
    input: &mut LineInput,
    source: &S,
    aggregator: Option<&Aggregator>,
    tx: mpsc::Sender<Record>,
) {
    let mut lines: u64 = 0;
    let mut unparsed: u64 = 0;
    let mut last_report_time = std::time::Instant::now();

    while let Some(line) = input.next_line().await {
        lines += 1;

        let Some(record) = source.parse(&line) else {
            unparsed += 1;
            continue;
        };

        if let Some(aggregator) = aggregator {
            aggregator.hit(&record);
        }

        if tx.send(record).await.is_err() {
            info!("Channel closed, reader stopping");
            break;
        }

        // Periodic progress report
        if last_report_time.elapsed() >= REPORT_INTERVAL {
            info!(lines = lines, unparsed = unparsed, "Reader progress");
            last_report_time = std::time::Instant::now();
        }
    }
}

fn log_aggregator_stats(stats: &AggregatorStats) {
    info!(
        windows_sent = stats.windows_sent,
        windows_dropped = stats.windows_dropped,
        late_records = stats.late_records,
        "Statistics aggregator completed"
    );
}
