//! Per-file batching in front of the record store.

use crate::metrics::PipelineMetrics;
use crate::record::Record;
use crate::storage::{InsertOutcome, RecordStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

pub const DEFAULT_BATCH_SIZE: usize = 1_000;
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// Nothing was buffered.
    Empty,
    Committed(InsertOutcome),
    /// The transaction failed or timed out and was rolled back. The batch was dropped.
    Failed { records: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub records: u64,
    pub flushes: u64,
    pub failed_flushes: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub dropped: u64,
}

/// Accumulates one file's records and commits them in bounded transactions.
///
/// A failed flush is logged and its records discarded. The caller must not
/// advance the file's cursor past records of a failed flush; see
/// [`BatchWriter::has_failures`].
pub struct BatchWriter {
    store: Arc<dyn RecordStore>,
    metrics: Arc<PipelineMetrics>,
    source: String,
    batch_size: usize,
    flush_timeout: Duration,
    batch: Vec<Record>,
    stats: BatchStats,
}

impl BatchWriter {
    pub fn new(
        store: Arc<dyn RecordStore>,
        metrics: Arc<PipelineMetrics>,
        source: String,
        batch_size: usize,
        flush_timeout: Duration,
    ) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            store,
            metrics,
            source,
            batch_size,
            flush_timeout,
            batch: Vec::with_capacity(batch_size.min(DEFAULT_BATCH_SIZE)),
            stats: BatchStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn stats(&self) -> BatchStats {
        self.stats
    }

    pub fn has_failures(&self) -> bool {
        self.stats.failed_flushes > 0
    }

    /// Buffer `record`, flushing once the batch reaches its configured size.
    pub async fn add(&mut self, record: Record) -> FlushStatus {
        self.batch.push(record);
        self.stats.records += 1;
        if self.batch.len() >= self.batch_size {
            self.flush().await
        } else {
            FlushStatus::Empty
        }
    }

    pub async fn flush(&mut self) -> FlushStatus {
        if self.batch.is_empty() {
            return FlushStatus::Empty;
        }

        let records = std::mem::replace(
            &mut self.batch,
            Vec::with_capacity(self.batch_size.min(DEFAULT_BATCH_SIZE)),
        );
        let batch_len = records.len();
        let started = Instant::now();

        let result = tokio::time::timeout(
            self.flush_timeout,
            self.store.insert_batch(self.source.clone(), records),
        )
        .await;
        let elapsed = started.elapsed();

        self.stats.flushes += 1;
        match result {
            Ok(Ok(outcome)) => {
                self.stats.inserted += outcome.inserted;
                self.stats.duplicates += outcome.duplicates;
                self.metrics
                    .flush_duration
                    .with_label_values(&["ok"])
                    .observe(elapsed.as_secs_f64());
                self.metrics
                    .batches_flushed_total
                    .with_label_values(&["ok"])
                    .inc();
                self.metrics.records_inserted_total.inc_by(outcome.inserted);
                self.metrics
                    .records_duplicate_total
                    .inc_by(outcome.duplicates);
                info!(
                    path = %self.source,
                    inserted = outcome.inserted,
                    duplicates = outcome.duplicates,
                    batch = batch_len,
                    "batch committed"
                );
                FlushStatus::Committed(outcome)
            }
            Ok(Err(err)) => {
                self.record_failure(batch_len, elapsed);
                error!(
                    error = %err,
                    path = %self.source,
                    batch = batch_len,
                    "insert batch failed"
                );
                FlushStatus::Failed { records: batch_len }
            }
            Err(_) => {
                self.record_failure(batch_len, elapsed);
                error!(
                    path = %self.source,
                    batch = batch_len,
                    timeout_secs = self.flush_timeout.as_secs_f64(),
                    "insert batch timed out"
                );
                FlushStatus::Failed { records: batch_len }
            }
        }
    }

    fn record_failure(&mut self, batch_len: usize, elapsed: Duration) {
        self.stats.failed_flushes += 1;
        self.stats.dropped += batch_len as u64;
        self.metrics
            .flush_duration
            .with_label_values(&["error"])
            .observe(elapsed.as_secs_f64());
        self.metrics
            .batches_flushed_total
            .with_label_values(&["error"])
            .inc();
        debug!(path = %self.source, dropped = batch_len, "batch cleared after failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use crate::reader::RawLine;
    use crate::record::RecordParser;
    use crate::storage::{SqliteStore, DEFAULT_BUSY_TIMEOUT};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingStore {
        batches: Mutex<Vec<usize>>,
        fail: bool,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl RecordStore for RecordingStore {
        async fn insert_batch(
            &self,
            _source: String,
            records: Vec<Record>,
        ) -> Result<InsertOutcome> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                anyhow::bail!("database unavailable");
            }
            self.batches.lock().expect("lock").push(records.len());
            Ok(InsertOutcome {
                inserted: records.len() as u64,
                duplicates: 0,
            })
        }

        async fn insert_event(&self, _event: Event) -> Result<()> {
            Ok(())
        }
    }

    fn record(n: usize) -> Record {
        RecordParser::new()
            .parse(&RawLine {
                offset: n as u64,
                bytes: format!("{{\"n\":{n}}}").into_bytes(),
            })
            .expect("valid")
    }

    fn metrics() -> Arc<PipelineMetrics> {
        Arc::new(PipelineMetrics::new().expect("metrics"))
    }

    #[tokio::test]
    async fn flushes_when_batch_is_full() {
        let store = Arc::new(RecordingStore::default());
        let mut writer = BatchWriter::new(
            store.clone(),
            metrics(),
            "a.log".into(),
            3,
            DEFAULT_FLUSH_TIMEOUT,
        );

        for n in 0..7 {
            writer.add(record(n)).await;
        }
        assert_eq!(*store.batches.lock().expect("lock"), vec![3, 3]);
        assert_eq!(writer.len(), 1);

        assert!(matches!(writer.flush().await, FlushStatus::Committed(_)));
        assert_eq!(*store.batches.lock().expect("lock"), vec![3, 3, 1]);
        assert_eq!(writer.flush().await, FlushStatus::Empty);
        assert_eq!(writer.stats().inserted, 7);
    }

    #[tokio::test]
    async fn failed_flush_clears_batch_and_is_reported() {
        let store = Arc::new(RecordingStore {
            fail: true,
            ..Default::default()
        });
        let metrics = metrics();
        let mut writer =
            BatchWriter::new(store, metrics.clone(), "a.log".into(), 10, DEFAULT_FLUSH_TIMEOUT);

        writer.add(record(1)).await;
        writer.add(record(2)).await;
        assert_eq!(writer.flush().await, FlushStatus::Failed { records: 2 });
        assert!(writer.is_empty());
        assert!(writer.has_failures());
        assert_eq!(writer.stats().dropped, 2);
        assert_eq!(
            metrics
                .batches_flushed_total
                .with_label_values(&["error"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn slow_flush_times_out() {
        let store = Arc::new(RecordingStore {
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        let mut writer = BatchWriter::new(
            store,
            metrics(),
            "a.log".into(),
            10,
            Duration::from_millis(10),
        );

        writer.add(record(1)).await;
        assert_eq!(writer.flush().await, FlushStatus::Failed { records: 1 });
        assert!(writer.has_failures());
    }

    #[tokio::test]
    async fn timed_out_flush_does_not_commit() {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(
            SqliteStore::open(dir.path().join("db.sqlite"), DEFAULT_BUSY_TIMEOUT).expect("open"),
        );
        let mut writer = BatchWriter::new(
            store.clone(),
            metrics(),
            "a.log".into(),
            usize::MAX,
            Duration::from_nanos(1),
        );

        for n in 0..20_000 {
            writer.add(record(n)).await;
        }
        assert_eq!(
            writer.flush().await,
            FlushStatus::Failed { records: 20_000 }
        );

        assert_eq!(store.record_count().await.expect("count"), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.record_count().await.expect("count"), 0);

        // The connection is free again for the next batch.
        let mut writer = BatchWriter::new(
            store.clone(),
            metrics(),
            "a.log".into(),
            10,
            DEFAULT_FLUSH_TIMEOUT,
        );
        writer.add(record(1)).await;
        assert!(matches!(writer.flush().await, FlushStatus::Committed(_)));
        assert_eq!(store.record_count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn reinserting_same_records_reports_duplicates() {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(
            SqliteStore::open(dir.path().join("db.sqlite"), DEFAULT_BUSY_TIMEOUT).expect("open"),
        );
        let mut writer = BatchWriter::new(
            store.clone(),
            metrics(),
            "a.log".into(),
            100,
            DEFAULT_FLUSH_TIMEOUT,
        );

        for n in 0..5 {
            writer.add(record(n)).await;
        }
        writer.flush().await;
        for n in 0..5 {
            writer.add(record(n)).await;
        }
        let status = writer.flush().await;

        assert_eq!(
            status,
            FlushStatus::Committed(InsertOutcome {
                inserted: 0,
                duplicates: 5
            })
        );
        assert_eq!(store.record_count().await.expect("count"), 5);
    }
}
