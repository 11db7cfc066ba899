//! Scan-cycle orchestration.
//!
//! Each cycle discovers the files under the root, runs one ingestion task per
//! file (bounded by a semaphore), waits for all of them, and then persists the
//! cursor state once. Cycles repeat on a fixed interval until cancelled.

use crate::cursor::CursorStore;
use crate::discovery::list_files;
use crate::metrics::PipelineMetrics;
use crate::pipeline::{ingest_file, FileReport, FileStatus, PipelineSettings};
use crate::storage::RecordStore;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub root: PathBuf,
    pub scan_interval: Duration,
    pub max_concurrent_files: usize,
    pub pipeline: PipelineSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub files: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub lines: u64,
    pub records: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub cursor_saved: bool,
}

impl CycleReport {
    fn absorb(&mut self, report: &FileReport) {
        match report.status {
            FileStatus::Completed => self.completed += 1,
            FileStatus::Cancelled => self.cancelled += 1,
            FileStatus::FlushFailed | FileStatus::ReadFailed => self.failed += 1,
        }
        self.lines += report.lines;
        self.records += report.batch.records;
        self.inserted += report.batch.inserted;
        self.duplicates += report.batch.duplicates;
        self.rejected += report.rejected;
    }
}

pub struct Tracker {
    settings: TrackerSettings,
    cursors: Arc<CursorStore>,
    store: Arc<dyn RecordStore>,
    metrics: Arc<PipelineMetrics>,
}

/// Sleep for `duration`; returns true if `cancel_token` fired first.
pub(crate) async fn sleep_or_cancel(duration: Duration, cancel_token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel_token.cancelled() => true,
        _ = sleep(duration) => false,
    }
}

impl Tracker {
    pub fn new(
        settings: TrackerSettings,
        cursors: Arc<CursorStore>,
        store: Arc<dyn RecordStore>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            settings,
            cursors,
            store,
            metrics,
        }
    }

    pub fn cursors(&self) -> &Arc<CursorStore> {
        &self.cursors
    }

    /// Run scan cycles until `cancel_token` fires.
    pub async fn run(&self, cancel_token: CancellationToken) {
        info!(
            root = %self.settings.root.display(),
            interval_secs = self.settings.scan_interval.as_secs(),
            max_concurrent_files = self.settings.max_concurrent_files,
            "log tracker started"
        );

        loop {
            let started = Instant::now();
            match self.run_cycle(&cancel_token).await {
                Ok(report) => {
                    let status = if cancel_token.is_cancelled() {
                        "cancelled"
                    } else {
                        "ok"
                    };
                    self.metrics.cycles_total.with_label_values(&[status]).inc();
                    self.metrics
                        .cycle_duration
                        .with_label_values(&[status])
                        .observe(started.elapsed().as_secs_f64());
                    info!(
                        files = report.files,
                        completed = report.completed,
                        failed = report.failed,
                        cancelled = report.cancelled,
                        lines = report.lines,
                        inserted = report.inserted,
                        duplicates = report.duplicates,
                        rejected = report.rejected,
                        cursor_saved = report.cursor_saved,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "scan cycle complete"
                    );
                }
                Err(err) => {
                    self.metrics
                        .cycles_total
                        .with_label_values(&["skipped"])
                        .inc();
                    warn!(
                        error = %err,
                        root = %self.settings.root.display(),
                        "scan cycle skipped"
                    );
                }
            }

            if cancel_token.is_cancelled() {
                break;
            }
            debug!(
                interval_secs = self.settings.scan_interval.as_secs(),
                "sleeping until next scan"
            );
            if sleep_or_cancel(self.settings.scan_interval, &cancel_token).await {
                break;
            }
        }

        info!("log tracker stopped");
    }

    /// One full pass over the root. Fails only if the root cannot be listed.
    pub async fn run_cycle(&self, cancel_token: &CancellationToken) -> Result<CycleReport> {
        let root = self.settings.root.clone();
        let files = task::spawn_blocking(move || list_files(&root))
            .await
            .context("file discovery join error")??;
        let files: Vec<PathBuf> = files
            .into_iter()
            .filter(|path| !self.cursors.is_state_file(path))
            .collect();

        self.metrics.files_last_cycle.set(files.len() as i64);
        debug!(file_count = files.len(), "discovered files");

        let mut report = CycleReport {
            files: files.len(),
            ..Default::default()
        };

        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_files.max(1)));
        let mut tasks = JoinSet::new();

        for path in files {
            let semaphore = semaphore.clone();
            let cursors = self.cursors.clone();
            let store = self.store.clone();
            let metrics = self.metrics.clone();
            let settings = self.settings.pipeline;
            let cancel_token = cancel_token.clone();

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (path, None);
                };
                let result =
                    ingest_file(&path, &cursors, store, metrics, &settings, &cancel_token).await;
                (path, Some(result))
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Some(Ok(file_report)))) => report.absorb(&file_report),
                Ok((path, Some(Err(err)))) => {
                    report.failed += 1;
                    self.metrics
                        .file_errors_total
                        .with_label_values(&["open"])
                        .inc();
                    warn!(error = %err, path = %path.display(), "skipping file this cycle");
                }
                Ok((path, None)) => {
                    report.failed += 1;
                    warn!(path = %path.display(), "file semaphore closed; skipping file");
                }
                Err(err) => {
                    report.failed += 1;
                    self.metrics
                        .file_errors_total
                        .with_label_values(&["panic"])
                        .inc();
                    error!(error = %err, "file pipeline task failed");
                }
            }
        }

        match self.cursors.save().await {
            Ok(()) => {
                report.cursor_saved = true;
                self.metrics
                    .cursor_saves_total
                    .with_label_values(&["ok"])
                    .inc();
            }
            Err(err) => {
                self.metrics
                    .cursor_saves_total
                    .with_label_values(&["error"])
                    .inc();
                warn!(
                    error = %err,
                    path = %self.cursors.path().display(),
                    "failed to save cursor state; will retry next cycle"
                );
            }
        }

        Ok(report)
    }
}
