//! Bulk delivery pipeline.
//!
//! Records are accumulated into a chunk that is written to Elasticsearch
//! with one bulk request when either:
//! - the chunk reaches the configured size (size-based flush)
//! - the oldest record in the chunk has waited the maximum delay (time-based flush)
//!
//! Documents the cluster rejects with 429 are resubmitted on their own, up to
//! `max_retries` times, then dropped. Any other rejection is reported to the
//! caller without retry.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::client::{BulkIndexer, BulkItem, ClientError, ItemOutcome};
use crate::config::Config;
use crate::record::Record;

/// Base delay for exponential backoff between rate-limit retries (in milliseconds).
const DEFAULT_BASE_DELAY_MS: u64 = 500;

/// Maximum delay between retries (in milliseconds).
const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Default channel capacity between the reader and the pipeline task.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1_000;

/// Configuration for the bulk pipeline.
#[derive(Debug, Clone)]
pub struct BulkConfig {
    /// Number of records that triggers a flush
    pub chunk_size: usize,

    /// Maximum time the oldest record of a chunk waits before a flush
    pub max_delay: Duration,

    /// Resubmissions of rate-limited documents before they are dropped
    pub max_retries: u32,

    /// strftime pattern for the per-record index name
    pub index_pattern: String,

    /// Records before this instant are skipped
    pub min_timestamp: Option<DateTime<Utc>>,

    /// Records after this instant are skipped
    pub max_timestamp: Option<DateTime<Utc>>,
}

impl BulkConfig {
    pub fn new(chunk_size: usize, max_delay: Duration) -> Self {
        Self {
            chunk_size,
            max_delay,
            ..Self::default()
        }
    }
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            max_delay: Duration::from_secs(10),
            max_retries: 3,
            index_pattern: "nginx-%Y.%m.%d".to_string(),
            min_timestamp: None,
            max_timestamp: None,
        }
    }
}

impl From<&Config> for BulkConfig {
    fn from(config: &Config) -> Self {
        Self {
            chunk_size: config.chunk_size,
            max_delay: config.max_delay,
            max_retries: config.max_retries,
            index_pattern: config.index_pattern.clone(),
            min_timestamp: config.min_timestamp,
            max_timestamp: config.max_timestamp,
        }
    }
}

/// Statistics about pipeline operations.
#[derive(Debug, Clone, Default)]
pub struct BulkStats {
    /// Total number of records received
    pub records_received: u64,

    /// Records outside the configured timestamp range
    pub records_skipped: u64,

    /// Records the cluster accepted
    pub records_indexed: u64,

    /// Records refused for a reason other than rate limiting, or lost with a failed request
    pub records_failed: u64,

    /// Rate-limited records dropped after the last retry
    pub records_dropped: u64,

    /// Resubmissions of rate-limited records
    pub retries: u64,

    /// Number of flush operations triggered by size threshold
    pub size_flushes: u64,

    /// Number of flush operations triggered by the chunk age
    pub time_flushes: u64,
}

/// Errors surfaced by a flush.
#[derive(Debug)]
pub enum BulkError {
    /// The bulk request itself failed; none of its documents were written
    Client(ClientError),

    /// Documents refused for a reason other than rate limiting
    Rejected {
        count: usize,
        status: u16,
        reason: String,
    },
}

impl std::fmt::Display for BulkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BulkError::Client(e) => write!(f, "Bulk request failed: {}", e),
            BulkError::Rejected {
                count,
                status,
                reason,
            } => write!(
                f,
                "{} documents rejected, first with status {}: {}",
                count, status, reason
            ),
        }
    }
}

impl std::error::Error for BulkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BulkError::Client(e) => Some(e),
            BulkError::Rejected { .. } => None,
        }
    }
}

impl From<ClientError> for BulkError {
    fn from(err: ClientError) -> Self {
        BulkError::Client(err)
    }
}

/// Records awaiting one bulk request, with the arrival time of the oldest.
#[derive(Debug)]
struct Chunk {
    records: Vec<Record>,
    started: Option<Instant>,
}

impl Chunk {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            started: None,
        }
    }

    fn push(&mut self, record: Record) {
        if self.records.is_empty() {
            self.started = Some(Instant::now());
        }
        self.records.push(record);
    }

    fn take(&mut self) -> Vec<Record> {
        self.started = None;
        let capacity = self.records.capacity();
        std::mem::replace(&mut self.records, Vec::with_capacity(capacity))
    }
}

/// Chunked bulk writer in front of a [`BulkIndexer`].
pub struct BulkPipeline {
    indexer: Arc<dyn BulkIndexer>,
    config: BulkConfig,
    chunk: Chunk,
    stats: BulkStats,
}

impl BulkPipeline {
    pub fn new(indexer: Arc<dyn BulkIndexer>, config: BulkConfig) -> Self {
        Self {
            chunk: Chunk::with_capacity(config.chunk_size),
            indexer,
            config,
            stats: BulkStats::default(),
        }
    }

    /// Add a record, flushing immediately once the chunk is full.
    ///
    /// Records outside the configured timestamp range are silently skipped.
    pub async fn ingest(&mut self, record: Record) -> Result<(), BulkError> {
        self.stats.records_received += 1;

        if !self.in_range(&record) {
            self.stats.records_skipped += 1;
            return Ok(());
        }

        self.chunk.push(record);

        if self.chunk.records.len() >= self.config.chunk_size {
            self.stats.size_flushes += 1;
            debug!(chunk_size = self.chunk.records.len(), "Size-based flush triggered");
            return self.flush().await;
        }

        Ok(())
    }

    /// When the current chunk must be flushed, `None` if it is empty.
    pub fn deadline(&self) -> Option<Instant> {
        self.chunk.started.map(|started| started + self.config.max_delay)
    }

    /// Flush if the oldest record has waited the maximum delay.
    pub async fn flush_if_due(&mut self) -> Result<(), BulkError> {
        match self.deadline() {
            Some(deadline) if deadline <= Instant::now() => {
                self.stats.time_flushes += 1;
                debug!(chunk_size = self.chunk.records.len(), "Time-based flush triggered");
                self.flush().await
            }
            _ => Ok(()),
        }
    }

    /// Write the current chunk, retrying only its rate-limited documents.
    pub async fn flush(&mut self) -> Result<(), BulkError> {
        let records = self.chunk.take();
        if records.is_empty() {
            return Ok(());
        }

        let mut pending: Vec<BulkItem> = records
            .into_iter()
            .map(|record| BulkItem {
                index: self.index_name(&record),
                record,
            })
            .collect();

        let mut rejected: Option<BulkError> = None;
        let mut attempt: u32 = 0;

        loop {
            let outcomes = match self.indexer.bulk(&pending).await {
                Ok(outcomes) if outcomes.len() == pending.len() => outcomes,
                Ok(outcomes) => {
                    self.stats.records_failed += pending.len() as u64;
                    return Err(BulkError::Client(ClientError::Parse(format!(
                        "{} outcomes for {} documents",
                        outcomes.len(),
                        pending.len()
                    ))));
                }
                Err(e) => {
                    self.stats.records_failed += pending.len() as u64;
                    return Err(e.into());
                }
            };

            let mut limited = Vec::new();
            for (item, outcome) in pending.into_iter().zip(outcomes) {
                match outcome {
                    ItemOutcome::Indexed => self.stats.records_indexed += 1,
                    ItemOutcome::RateLimited => limited.push(item),
                    ItemOutcome::Failed { status, reason } => {
                        self.stats.records_failed += 1;
                        match rejected.as_mut() {
                            Some(BulkError::Rejected { count, .. }) => *count += 1,
                            _ => {
                                rejected = Some(BulkError::Rejected {
                                    count: 1,
                                    status,
                                    reason,
                                })
                            }
                        }
                    }
                }
            }

            if limited.is_empty() {
                break;
            }

            if attempt >= self.config.max_retries {
                self.stats.records_dropped += limited.len() as u64;
                error!(
                    dropped = limited.len(),
                    retries = attempt,
                    "Rate limited documents dropped after exhausting retries"
                );
                break;
            }

            attempt += 1;
            self.stats.retries += 1;
            let delay = backoff_delay(attempt);
            warn!(
                documents = limited.len(),
                attempt = attempt,
                max_retries = self.config.max_retries,
                delay_ms = delay.as_millis(),
                "Bulk request rate limited, retrying"
            );
            sleep(delay).await;
            pending = limited;
        }

        match rejected {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Destination index for a record, formatted from its own timestamp.
    fn index_name(&self, record: &Record) -> String {
        let mut name = String::new();
        if write!(name, "{}", record.timestamp.format(&self.config.index_pattern)).is_err() {
            // validated at startup, only reachable with a hand-built config
            return self.config.index_pattern.clone();
        }
        name
    }

    fn in_range(&self, record: &Record) -> bool {
        if let Some(min) = self.config.min_timestamp {
            if record.timestamp < min {
                return false;
            }
        }
        if let Some(max) = self.config.max_timestamp {
            if record.timestamp > max {
                return false;
            }
        }
        true
    }

    /// Get the current number of records in the chunk.
    pub fn len(&self) -> usize {
        self.chunk.records.len()
    }

    /// Check if the chunk is empty.
    pub fn is_empty(&self) -> bool {
        self.chunk.records.is_empty()
    }

    /// Get current pipeline statistics.
    pub fn stats(&self) -> &BulkStats {
        &self.stats
    }
}

/// Exponential backoff with up to 25% jitter, capped at 30 seconds.
fn backoff_delay(attempt: u32) -> Duration {
    let exponential_delay = DEFAULT_BASE_DELAY_MS.saturating_mul(1 << attempt.min(10));
    let jitter = rand::random::<u64>() % (exponential_delay / 4 + 1);
    let total_delay = exponential_delay.saturating_add(jitter).min(MAX_RETRY_DELAY_MS);
    Duration::from_millis(total_delay)
}

/// Drive a pipeline from a channel until the channel closes.
///
/// The partial chunk is flushed when the channel closes. Flush errors are
/// logged and never stop the task.
pub async fn run_pipeline(mut rx: mpsc::Receiver<Record>, mut pipeline: BulkPipeline) -> BulkStats {
    loop {
        let deadline = pipeline.deadline();

        tokio::select! {
            maybe_record = rx.recv() => {
                match maybe_record {
                    Some(record) => {
                        if let Err(e) = pipeline.ingest(record).await {
                            warn!(error = %e, "Failed to flush chunk");
                        }
                    }
                    None => {
                        if !pipeline.is_empty() {
                            info!(remaining = pipeline.len(), "Input closed, flushing remaining records");
                            if let Err(e) = pipeline.flush().await {
                                warn!(error = %e, "Failed to flush chunk");
                            }
                        }
                        break;
                    }
                }
            }

            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if let Err(e) = pipeline.flush_if_due().await {
                    warn!(error = %e, "Failed to flush chunk");
                }
            }
        }
    }

    pipeline.stats().clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use std::sync::Mutex;

    type Policy = fn(call: usize, item: usize) -> ItemOutcome;

    /// Records every request and answers per item according to `policy`.
    struct MockIndexer {
        calls: Mutex<Vec<Vec<String>>>,
        policy: Policy,
    }

    impl MockIndexer {
        fn new(policy: Policy) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                policy,
            })
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BulkIndexer for MockIndexer {
        async fn bulk(&self, items: &[BulkItem]) -> Result<Vec<ItemOutcome>, ClientError> {
            let mut calls = self.calls.lock().unwrap();
            let call = calls.len();
            calls.push(items.iter().map(|i| i.index.clone()).collect());
            Ok((0..items.len()).map(|i| (self.policy)(call, i)).collect())
        }
    }

    struct FailingIndexer;

    #[async_trait]
    impl BulkIndexer for FailingIndexer {
        async fn bulk(&self, _items: &[BulkItem]) -> Result<Vec<ItemOutcome>, ClientError> {
            Err(ClientError::Timeout)
        }
    }

    fn accept_all(_: usize, _: usize) -> ItemOutcome {
        ItemOutcome::Indexed
    }

    fn record_at(rfc3339: &str) -> Record {
        Record::new(DateTime::parse_from_rfc3339(rfc3339).unwrap(), 200)
    }

    fn record() -> Record {
        record_at("2024-03-01T12:00:00+00:00")
    }

    fn config(chunk_size: usize) -> BulkConfig {
        BulkConfig {
            max_retries: 2,
            ..BulkConfig::new(chunk_size, Duration::from_secs(10))
        }
    }

    #[tokio::test]
    async fn test_full_chunk_flushes_immediately() {
        let indexer = MockIndexer::new(accept_all);
        let mut pipeline = BulkPipeline::new(indexer.clone(), config(3));

        pipeline.ingest(record()).await.unwrap();
        pipeline.ingest(record()).await.unwrap();
        assert!(indexer.calls().is_empty());

        pipeline.ingest(record()).await.unwrap();
        assert_eq!(indexer.calls().len(), 1);
        assert_eq!(indexer.calls()[0].len(), 3);
        assert!(pipeline.is_empty());
        assert_eq!(pipeline.stats().size_flushes, 1);
        assert_eq!(pipeline.stats().records_indexed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_follows_oldest_record() {
        let indexer = MockIndexer::new(accept_all);
        let mut pipeline = BulkPipeline::new(indexer.clone(), config(100));
        assert!(pipeline.deadline().is_none());

        let start = Instant::now();
        pipeline.ingest(record()).await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        pipeline.ingest(record()).await.unwrap();
        assert_eq!(pipeline.deadline(), Some(start + Duration::from_secs(10)));

        pipeline.flush_if_due().await.unwrap();
        assert!(indexer.calls().is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;
        pipeline.flush_if_due().await.unwrap();
        assert_eq!(indexer.calls().len(), 1);
        assert_eq!(indexer.calls()[0].len(), 2);
        assert_eq!(pipeline.stats().time_flushes, 1);
        assert!(pipeline.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipeline_task_time_flush() {
        let indexer = MockIndexer::new(accept_all);
        let pipeline = BulkPipeline::new(indexer.clone(), config(100));
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(run_pipeline(rx, pipeline));

        tx.send(record()).await.unwrap();
        tx.send(record()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(indexer.calls().is_empty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(indexer.calls().len(), 1);
        assert_eq!(indexer.calls()[0].len(), 2);

        drop(tx);
        let stats = handle.await.unwrap();
        assert_eq!(stats.time_flushes, 1);
        assert_eq!(stats.records_indexed, 2);
    }

    #[tokio::test]
    async fn test_pipeline_task_flushes_on_close() {
        let indexer = MockIndexer::new(accept_all);
        let pipeline = BulkPipeline::new(indexer.clone(), config(100));
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(run_pipeline(rx, pipeline));

        for _ in 0..5 {
            tx.send(record()).await.unwrap();
        }
        drop(tx);

        let stats = handle.await.unwrap();
        assert_eq!(stats.records_indexed, 5);
        assert_eq!(indexer.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_retries_are_bounded() {
        let indexer = MockIndexer::new(|_, _| ItemOutcome::RateLimited);
        let mut pipeline = BulkPipeline::new(indexer.clone(), config(2));

        pipeline.ingest(record()).await.unwrap();
        pipeline.ingest(record()).await.unwrap();

        // one initial request plus max_retries resubmissions
        assert_eq!(indexer.calls().len(), 3);
        assert_eq!(pipeline.stats().retries, 2);
        assert_eq!(pipeline.stats().records_dropped, 2);
        assert_eq!(pipeline.stats().records_indexed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_rate_limited_items_are_resubmitted() {
        // first request: item 1 rate limited; everything else accepted
        let indexer = MockIndexer::new(|call, item| {
            if call == 0 && item == 1 {
                ItemOutcome::RateLimited
            } else {
                ItemOutcome::Indexed
            }
        });
        let mut pipeline = BulkPipeline::new(indexer.clone(), config(3));

        pipeline.ingest(record_at("2024-03-01T10:00:00+00:00")).await.unwrap();
        pipeline.ingest(record_at("2024-03-02T10:00:00+00:00")).await.unwrap();
        pipeline.ingest(record_at("2024-03-03T10:00:00+00:00")).await.unwrap();

        let calls = indexer.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1], vec!["nginx-2024.03.02".to_string()]);
        assert_eq!(pipeline.stats().records_indexed, 3);
        assert_eq!(pipeline.stats().retries, 1);
    }

    #[tokio::test]
    async fn test_other_failures_are_not_retried() {
        let indexer = MockIndexer::new(|_, item| {
            if item == 0 {
                ItemOutcome::Failed {
                    status: 400,
                    reason: "mapper_parsing_exception".to_string(),
                }
            } else {
                ItemOutcome::Indexed
            }
        });
        let mut pipeline = BulkPipeline::new(indexer.clone(), config(2));

        pipeline.ingest(record()).await.unwrap();
        let err = pipeline.ingest(record()).await.unwrap_err();

        assert!(matches!(err, BulkError::Rejected { count: 1, status: 400, .. }));
        assert_eq!(indexer.calls().len(), 1);
        assert_eq!(pipeline.stats().records_indexed, 1);
        assert_eq!(pipeline.stats().records_failed, 1);
    }

    #[tokio::test]
    async fn test_request_failure_is_surfaced() {
        let mut pipeline = BulkPipeline::new(Arc::new(FailingIndexer), config(1));
        let err = pipeline.ingest(record()).await.unwrap_err();
        assert!(matches!(err, BulkError::Client(ClientError::Timeout)));
        assert_eq!(pipeline.stats().records_failed, 1);
        assert!(pipeline.is_empty());
    }

    #[tokio::test]
    async fn test_records_outside_range_are_skipped() {
        let indexer = MockIndexer::new(accept_all);
        let cfg = BulkConfig {
            min_timestamp: Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()),
            max_timestamp: Some(Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap()),
            ..config(10)
        };
        let mut pipeline = BulkPipeline::new(indexer.clone(), cfg);

        pipeline.ingest(record_at("2024-02-29T23:59:59+00:00")).await.unwrap();
        pipeline.ingest(record_at("2024-03-01T12:00:00+00:00")).await.unwrap();
        // 01:00 at +02:00 is 23:00 UTC on the 1st, still inside
        pipeline.ingest(record_at("2024-03-02T01:00:00+02:00")).await.unwrap();
        pipeline.ingest(record_at("2024-03-02T00:00:01+00:00")).await.unwrap();

        assert_eq!(pipeline.len(), 2);
        assert_eq!(pipeline.stats().records_skipped, 2);
    }

    #[tokio::test]
    async fn test_index_name_uses_record_timestamp() {
        let indexer = MockIndexer::new(accept_all);
        let mut pipeline = BulkPipeline::new(indexer.clone(), config(2));

        pipeline.ingest(record_at("2024-12-31T23:59:59+00:00")).await.unwrap();
        pipeline.ingest(record_at("2025-01-01T00:00:01+00:00")).await.unwrap();

        assert_eq!(
            indexer.calls()[0],
            vec!["nginx-2024.12.31".to_string(), "nginx-2025.01.01".to_string()]
        );
    }

    #[test]
    fn test_backoff_delay_increases_and_caps() {
        let delay1 = backoff_delay(1);
        assert!(delay1.as_millis() >= 1000 && delay1.as_millis() <= 1250);

        let delay2 = backoff_delay(2);
        assert!(delay2.as_millis() >= 2000 && delay2.as_millis() <= 2500);

        assert!(backoff_delay(20).as_millis() <= MAX_RETRY_DELAY_MS as u128);
    }
}
