//! Windowed HTTP traffic statistics.
//!
//! Records are grouped into fixed-width time windows keyed by their bucket
//! id (timestamp truncated to the interval). A window is emitted once both
//! its end and its most recent record are at least `delay` seconds in the
//! past, so late arrivals from the log producer still land in the right
//! window. Each window is emitted at most once; records for a window that
//! was already sent are logged and dropped.
//!
//! Per window and per group of (host, path segments, status, cache status)
//! the aggregator emits:
//! - `request_time.sum` / `request_time.count`, binned by request time
//! - `upstream_response_time.sum` / `.count`, binned by upstream time
//! - `bytes_sent`

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::carbon::{format_line, MetricValue, MetricsSink};
use crate::config::CarbonConfig;
use crate::record::Record;

/// How many sent bucket ids are remembered to recognise late records.
pub const SENT_HISTORY: usize = 100;

/// Bin for zero and every latency below [`BIN_THRESHOLD`].
pub const LOWEST_BIN: i32 = -31;

/// Smallest latency (seconds) with a bin of its own.
pub const BIN_THRESHOLD: f64 = 0.001;

/// How often the window map is scanned for ready windows.
const SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Placeholder for a missing path segment.
const NO_SEGMENT: &str = "#";

/// Placeholder for a numeric path segment.
const ID_SEGMENT: &str = "<id>";

/// Placeholder for a UUID path segment.
const UUID_SEGMENT: &str = "<uuid>";

/// Placeholder for a missing cache status.
const NO_CACHE_STATUS: &str = "NONE";

/// Aggregator settings.
#[derive(Debug, Clone)]
pub struct StatsConfig {
    /// Window width in seconds
    pub interval: u64,

    /// Wait after the window end and after its last record
    pub delay: Duration,

    /// Dotted metric name prefix
    pub prefix: String,
}

impl From<&CarbonConfig> for StatsConfig {
    fn from(config: &CarbonConfig) -> Self {
        Self {
            interval: config.interval,
            delay: config.delay,
            prefix: config.prefix.clone(),
        }
    }
}

/// The part of a record the statistics need.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    host: String,
    path_1: Option<String>,
    path_2: Option<String>,
    status: u16,
    cache_status: Option<String>,
    request_time: f64,
    upstream_time: Option<f64>,
    bytes_sent: u64,
}

impl From<&Record> for Sample {
    fn from(record: &Record) -> Self {
        Self {
            host: record.host.clone(),
            path_1: record.request_path_1.clone(),
            path_2: record.request_path_2.clone(),
            status: record.status,
            cache_status: record.upstream_cache_status.clone(),
            request_time: record.request_time,
            upstream_time: record.last_upstream_time(),
            bytes_sent: record.bytes_sent,
        }
    }
}

#[derive(Debug)]
struct Window {
    samples: Vec<Sample>,
    /// Wall-clock time the latest sample arrived
    last_seen: f64,
}

#[derive(Debug, Default)]
struct WindowState {
    open: HashMap<i64, Window>,
    sent: VecDeque<i64>,
    /// Set once the final flush has drained `open`
    closed: bool,
}

impl WindowState {
    fn mark_sent(&mut self, bucket: i64) {
        self.sent.push_back(bucket);
        if self.sent.len() > SENT_HISTORY {
            self.sent.pop_front();
        }
    }
}

/// What happened to a record passed to [`Aggregator::hit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hit {
    /// Added to the window with this bucket id
    Accepted(i64),
    /// Status 0, not an HTTP request
    NotHttp,
    /// The window with this bucket id was already sent
    Late(i64),
    /// The aggregator has shut down
    Stopped,
}

/// Result of delivering one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Dropped,
    /// The connection broke in a way that means the collector went away
    Shutdown,
}

/// Counters reported at shutdown.
#[derive(Debug, Clone, Default)]
pub struct AggregatorStats {
    pub windows_sent: u64,
    pub windows_dropped: u64,
    pub late_records: u64,
}

/// Window state shared between the reader (`hit`) and the scan worker.
pub struct Aggregator {
    config: StatsConfig,
    state: Mutex<WindowState>,
    windows_sent: AtomicU64,
    windows_dropped: AtomicU64,
    late_records: AtomicU64,
}

impl Aggregator {
    pub fn new(config: StatsConfig) -> Self {
        Self {
            config,
            state: Mutex::new(WindowState::default()),
            windows_sent: AtomicU64::new(0),
            windows_dropped: AtomicU64::new(0),
            late_records: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bucket id of a unix timestamp: the timestamp truncated to the interval.
    pub fn bucket_id(&self, unix_secs: i64) -> i64 {
        let interval = self.config.interval.max(1) as i64;
        unix_secs.div_euclid(interval) * interval
    }

    /// Add a record to its window, stamped with the current wall-clock time.
    pub fn hit(&self, record: &Record) -> Hit {
        self.hit_at(record, unix_now())
    }

    /// Add a record to its window as if it arrived at `now` (unix seconds).
    pub fn hit_at(&self, record: &Record, now: f64) -> Hit {
        if record.status == 0 {
            return Hit::NotHttp;
        }
        let bucket = self.bucket_id(record.timestamp.timestamp());
        let sample = Sample::from(record);

        {
            let mut state = self.lock();
            if state.closed {
                return Hit::Stopped;
            }
            if !state.sent.contains(&bucket) {
                let window = state.open.entry(bucket).or_insert_with(|| Window {
                    samples: Vec::new(),
                    last_seen: now,
                });
                window.samples.push(sample);
                window.last_seen = now;
                return Hit::Accepted(bucket);
            }
        }

        self.late_records.fetch_add(1, Ordering::Relaxed);
        error!(
            bucket = bucket,
            delay_secs = self.config.delay.as_secs(),
            "Statistics for this interval were already sent, record ignored; \
             the stats delay should be increased"
        );
        Hit::Late(bucket)
    }

    /// Remove and return every window that is ready at `now`, oldest first.
    ///
    /// Removed windows are marked sent under the same lock, so a record
    /// arriving afterwards is treated as late.
    pub fn take_ready(&self, now: f64) -> Vec<(i64, Vec<Sample>)> {
        let interval = self.config.interval as f64;
        let delay = self.config.delay.as_secs_f64();

        let mut state = self.lock();
        let mut ready: Vec<i64> = state
            .open
            .iter()
            .filter(|(bucket, window)| {
                **bucket as f64 + interval + delay <= now && window.last_seen + delay <= now
            })
            .map(|(bucket, _)| *bucket)
            .collect();
        ready.sort_unstable();

        Self::remove_windows(&mut state, ready)
    }

    /// Stop accepting records and remove every open window regardless of
    /// readiness.
    pub fn close(&self) -> Vec<(i64, Vec<Sample>)> {
        let mut state = self.lock();
        state.closed = true;
        let mut buckets: Vec<i64> = state.open.keys().copied().collect();
        buckets.sort_unstable();
        Self::remove_windows(&mut state, buckets)
    }

    fn remove_windows(state: &mut WindowState, buckets: Vec<i64>) -> Vec<(i64, Vec<Sample>)> {
        buckets
            .into_iter()
            .filter_map(|bucket| {
                let window = state.open.remove(&bucket)?;
                state.mark_sent(bucket);
                Some((bucket, window.samples))
            })
            .collect()
    }

    #[cfg(test)]
    fn open_windows(&self) -> usize {
        self.lock().open.len()
    }

    /// Render the metric lines of one window.
    fn render(&self, bucket: i64, samples: &[Sample]) -> String {
        self.metrics(samples)
            .into_iter()
            .map(|(name, value)| format_line(&name, value, bucket))
            .collect()
    }

    /// Compute the metrics of one window's samples.
    fn metrics(&self, samples: &[Sample]) -> Vec<(String, MetricValue)> {
        let mut request_time: BTreeMap<[String; 6], (f64, u64)> = BTreeMap::new();
        let mut upstream_time: BTreeMap<[String; 5], (f64, u64)> = BTreeMap::new();
        let mut bytes_sent: BTreeMap<[String; 4], u64> = BTreeMap::new();

        for sample in samples {
            let host = sample.host.clone();
            let path_1 = normalize_segment(sample.path_1.as_deref());
            let path_2 = normalize_segment(sample.path_2.as_deref());
            let status = sample.status.to_string();
            let cache_status = sample
                .cache_status
                .clone()
                .unwrap_or_else(|| NO_CACHE_STATUS.to_string());

            let entry = request_time
                .entry([
                    host.clone(),
                    path_1.clone(),
                    path_2.clone(),
                    status.clone(),
                    cache_status,
                    bin_label(latency_bin(sample.request_time)),
                ])
                .or_default();
            entry.0 += sample.request_time;
            entry.1 += 1;

            if let Some(upstream) = sample.upstream_time {
                let entry = upstream_time
                    .entry([
                        host.clone(),
                        path_1.clone(),
                        path_2.clone(),
                        status.clone(),
                        bin_label(latency_bin(upstream)),
                    ])
                    .or_default();
                entry.0 += upstream;
                entry.1 += 1;
            }

            *bytes_sent.entry([host, path_1, path_2, status]).or_default() += sample.bytes_sent;
        }

        let prefix = &self.config.prefix;
        let mut metrics = Vec::new();

        for (dims, (sum, _)) in &request_time {
            metrics.push((metric_name(prefix, &["request_time", "sum"], dims), MetricValue::Float(*sum)));
        }
        for (dims, (_, count)) in &request_time {
            metrics.push((metric_name(prefix, &["request_time", "count"], dims), MetricValue::Int(*count)));
        }
        for (dims, (sum, _)) in &upstream_time {
            metrics.push((
                metric_name(prefix, &["upstream_response_time", "sum"], dims),
                MetricValue::Float(*sum),
            ));
        }
        for (dims, (_, count)) in &upstream_time {
            metrics.push((
                metric_name(prefix, &["upstream_response_time", "count"], dims),
                MetricValue::Int(*count),
            ));
        }
        for (dims, sum) in &bytes_sent {
            metrics.push((metric_name(prefix, &["bytes_sent"], dims), MetricValue::Int(*sum)));
        }

        metrics
    }

    /// Send one window, reconnecting and resending once on failure.
    pub async fn deliver(&self, sink: &mut dyn MetricsSink, bucket: i64, samples: &[Sample]) -> Delivery {
        let payload = self.render(bucket, samples);
        if payload.is_empty() {
            return Delivery::Sent;
        }

        let outcome = match sink.send(&payload).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(bucket = bucket, error = %e, "Sending metrics failed, reconnecting");
                match sink.reconnect().await {
                    Ok(()) => sink.send(&payload).await,
                    Err(e) => Err(e),
                }
            }
        };

        match outcome {
            Ok(()) => {
                self.windows_sent.fetch_add(1, Ordering::Relaxed);
                debug!(bucket = bucket, records = samples.len(), "Window metrics sent");
                Delivery::Sent
            }
            Err(e) if is_shutdown(&e) => {
                self.windows_dropped.fetch_add(1, Ordering::Relaxed);
                error!(bucket = bucket, error = %e, "Metrics connection terminated");
                Delivery::Shutdown
            }
            Err(e) => {
                self.windows_dropped.fetch_add(1, Ordering::Relaxed);
                error!(bucket = bucket, records = samples.len(), error = %e, "Can't send metrics, window dropped");
                Delivery::Dropped
            }
        }
    }

    /// Deliver windows in order; stops at the first shutdown.
    async fn process(&self, sink: &mut dyn MetricsSink, windows: Vec<(i64, Vec<Sample>)>) -> Delivery {
        let total = windows.len();
        for (done, (bucket, samples)) in windows.into_iter().enumerate() {
            if self.deliver(sink, bucket, &samples).await == Delivery::Shutdown {
                let skipped = total - done - 1;
                if skipped > 0 {
                    self.windows_dropped.fetch_add(skipped as u64, Ordering::Relaxed);
                    warn!(windows = skipped, "Dropping remaining ready windows");
                }
                return Delivery::Shutdown;
            }
        }
        Delivery::Sent
    }

    /// Current counters.
    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            windows_sent: self.windows_sent.load(Ordering::Relaxed),
            windows_dropped: self.windows_dropped.load(Ordering::Relaxed),
            late_records: self.late_records.load(Ordering::Relaxed),
        }
    }
}

/// Scan for ready windows every second and deliver them until `cancel`
/// fires or the connection is terminated, then flush everything left.
pub async fn run_aggregator(
    aggregator: Arc<Aggregator>,
    mut sink: Box<dyn MetricsSink>,
    cancel: CancellationToken,
) -> AggregatorStats {
    let mut ticker = interval(SCAN_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the first immediate tick
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Statistics aggregator stopping");
                break;
            }
            _ = ticker.tick() => {
                let ready = aggregator.take_ready(unix_now());
                if ready.is_empty() {
                    continue;
                }
                if aggregator.process(sink.as_mut(), ready).await == Delivery::Shutdown {
                    warn!("Metrics connection closed, statistics aggregator stopping");
                    break;
                }
            }
        }
    }

    let remaining = aggregator.close();
    if !remaining.is_empty() {
        info!(windows = remaining.len(), "Flushing remaining statistics windows");
        aggregator.process(sink.as_mut(), remaining).await;
    }

    aggregator.stats()
}

fn is_shutdown(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::BrokenPipe | io::ErrorKind::Interrupted)
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Collapse high-cardinality path segments into placeholders.
pub fn normalize_segment(segment: Option<&str>) -> String {
    match segment {
        None | Some("") => NO_SEGMENT.to_string(),
        Some(s) if s.len() == 36 && Uuid::try_parse(s).is_ok() => UUID_SEGMENT.to_string(),
        Some(s) if s.bytes().all(|b| b.is_ascii_digit()) => ID_SEGMENT.to_string(),
        Some(s) => s.to_string(),
    }
}

/// Logarithmic latency bin: `round(log10(seconds) * 10)`, about 26% wide.
/// Zero and anything below [`BIN_THRESHOLD`] share [`LOWEST_BIN`].
pub fn latency_bin(seconds: f64) -> i32 {
    if seconds >= BIN_THRESHOLD {
        (seconds.log10() * 10.0).round() as i32
    } else {
        LOWEST_BIN
    }
}

/// Metric path label of a bin: its lower bound in microseconds, `0` for
/// the lowest bin.
pub fn bin_label(bin: i32) -> String {
    if bin <= LOWEST_BIN {
        return "0".to_string();
    }
    let micros = 10f64.powf(f64::from(bin) / 10.0) * 1_000_000.0;
    format!("{}", micros.round() as u64)
}

/// Join the prefix with metric parts; dots and whitespace inside a part are
/// replaced so each part stays one path component.
pub fn metric_name(prefix: &str, kind: &[&str], dims: &[String]) -> String {
    let mut parts: Vec<String> = prefix
        .split('.')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    parts.extend(kind.iter().map(|k| sanitize(k)));
    parts.extend(dims.iter().map(|d| sanitize(d)));
    parts.join(".")
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c == '.' || c.is_whitespace() { '_' } else { c })
        .collect()
}
