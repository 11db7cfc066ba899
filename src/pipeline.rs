//! One file's ingestion pass: read the unread suffix, validate each line, batch
//! the records into storage, and advance the cursor when everything landed.

use crate::batch::{BatchStats, BatchWriter, DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_TIMEOUT};
use crate::cursor::{identity_for, CursorStore, ResetReason};
use crate::metrics::PipelineMetrics;
use crate::reader::{IncrementalReader, LineRead, DEFAULT_MAX_LINE_BYTES};
use crate::record::RecordParser;
use crate::storage::RecordStore;
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub max_line_bytes: usize,
    pub batch_size: usize,
    pub flush_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    /// Read to the end and every batch committed; cursor advanced.
    Completed,
    /// At least one batch failed; cursor left where it was.
    FlushFailed,
    /// Reading stopped on an I/O error; cursor left where it was.
    ReadFailed,
    /// Cancellation arrived mid-read; cursor left where it was.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct FileReport {
    pub path: PathBuf,
    pub status: FileStatus,
    pub start_offset: u64,
    pub end_offset: u64,
    pub lines: u64,
    pub rejected: u64,
    pub oversized: u64,
    pub pending_bytes: u64,
    pub reset: Option<ResetReason>,
    pub batch: BatchStats,
}

/// Run one file through reader, parser and batch writer.
///
/// Returns an error only when the file cannot be opened or positioned; every
/// later problem is reflected in [`FileReport::status`].
pub async fn ingest_file(
    path: &Path,
    cursors: &CursorStore,
    store: Arc<dyn RecordStore>,
    metrics: Arc<PipelineMetrics>,
    settings: &PipelineSettings,
    cancel_token: &CancellationToken,
) -> Result<FileReport> {
    let identity = identity_for(path);
    let mut reader = IncrementalReader::open(path, settings.max_line_bytes).await?;
    let stamp = *reader.stamp();
    let resume = cursors.resume_point(&identity, &stamp);

    match resume.reset {
        Some(ResetReason::Truncated) => warn!(
            path = %path.display(),
            previous_offset = cursors.get(&identity),
            current_size = stamp.size,
            "file truncated; reading from the beginning"
        ),
        Some(ResetReason::Replaced) => warn!(
            path = %path.display(),
            previous_offset = cursors.get(&identity),
            "file replaced since last read; reading from the beginning"
        ),
        None => {}
    }

    reader.seek(resume.offset).await?;
    let parser = RecordParser::new();
    let mut writer = BatchWriter::new(
        store,
        metrics.clone(),
        identity.clone(),
        settings.batch_size,
        settings.flush_timeout,
    );

    let mut rejected = 0u64;
    let mut cancelled = false;
    let mut read_failed = false;

    loop {
        if cancel_token.is_cancelled() {
            cancelled = true;
            break;
        }

        match reader.next_line().await {
            Ok(Some(LineRead::Line(raw))) => {
                metrics.lines_read_total.inc();
                match parser.parse(&raw) {
                    Ok(record) => {
                        writer.add(record).await;
                    }
                    Err(rejection) => {
                        rejected += 1;
                        metrics
                            .lines_rejected_total
                            .with_label_values(&[rejection.metric_label()])
                            .inc();
                        debug!(
                            path = %path.display(),
                            offset = raw.offset,
                            reason = %rejection,
                            "skipping line"
                        );
                    }
                }
            }
            Ok(Some(LineRead::Oversized { offset, length })) => {
                metrics.oversized_lines_total.inc();
                warn!(
                    path = %path.display(),
                    offset,
                    length,
                    limit = settings.max_line_bytes,
                    "skipping oversized line"
                );
            }
            Ok(None) => break,
            Err(err) => {
                warn!(
                    error = %err,
                    path = %path.display(),
                    offset = reader.consumed_offset(),
                    "read failed; will retry next cycle"
                );
                metrics.file_errors_total.with_label_values(&["read"]).inc();
                read_failed = true;
                break;
            }
        }
    }

    // Drain the partial batch on every exit path, including cancellation.
    writer.flush().await;

    let summary = reader.finish();
    let batch = writer.stats();

    let status = if cancelled {
        FileStatus::Cancelled
    } else if read_failed {
        FileStatus::ReadFailed
    } else if writer.has_failures() {
        metrics.file_errors_total.with_label_values(&["flush"]).inc();
        FileStatus::FlushFailed
    } else {
        FileStatus::Completed
    };

    if status == FileStatus::Completed {
        cursors.set(&identity, summary.end_offset, &stamp);
    } else {
        warn!(
            path = %path.display(),
            status = ?status,
            cursor = summary.start_offset,
            failed_batches = batch.failed_flushes,
            "cursor not advanced"
        );
    }

    if summary.lines > 0 || summary.oversized > 0 {
        info!(
            path = %path.display(),
            from = summary.start_offset,
            to = summary.end_offset,
            lines = summary.lines,
            records = batch.records,
            inserted = batch.inserted,
            duplicates = batch.duplicates,
            rejected,
            "file ingested"
        );
    }

    Ok(FileReport {
        path: path.to_path_buf(),
        status,
        start_offset: summary.start_offset,
        end_offset: summary.end_offset,
        lines: summary.lines,
        rejected,
        oversized: summary.oversized,
        pending_bytes: summary.pending_bytes,
        reset: resume.reset,
        batch,
    })
}
