//! Process wiring for the agent: opens storage and cursor state, starts the
//! tracker and the event pipeline, and tears them down on shutdown.

use crate::config::Config;
use crate::cursor::CursorStore;
use crate::events::{event_channel, run_event_sink, run_event_source, EventSource};
use crate::metrics::PipelineMetrics;
use crate::storage::{RecordStore, SqliteStore};
use crate::tracker::{Tracker, TrackerSettings};
use anyhow::{Context, Result};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Environment variable to force immediate batch flushing (testing mode).
pub const FORCE_FLUSH_ENV: &str = "LOG_INGEST_FORCE_FLUSH";

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolve the effective batch size based on config and environment overrides.
pub fn resolve_batch_size(configured: usize) -> usize {
    parse_force_flush(std::env::var(FORCE_FLUSH_ENV).ok().as_deref(), configured)
}

fn parse_force_flush(value: Option<&str>, configured: usize) -> usize {
    let Some(value) = value else {
        return configured.max(1);
    };
    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("true") || trimmed == "1" {
        warn!(
            env = FORCE_FLUSH_ENV,
            configured, "forcing batch size to 1 for immediate flush (testing mode)"
        );
        1
    } else if trimmed.eq_ignore_ascii_case("false") || trimmed == "0" {
        configured.max(1)
    } else {
        warn!(
            env = FORCE_FLUSH_ENV,
            value = trimmed,
            configured,
            "unrecognized value for {}; using configured batch size",
            FORCE_FLUSH_ENV
        );
        configured.max(1)
    }
}

/// Run until Ctrl-C with no upstream event sources.
pub async fn run(config: &Config) -> Result<()> {
    run_until(config, Vec::new(), async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed while waiting for shutdown signal");
        }
        info!("shutdown signal received");
    })
    .await
}

/// Run the tracker and event pipeline until `shutdown` resolves or the tracker
/// exits on its own.
///
/// Fails before starting anything if the root directory is unusable or the
/// database cannot be opened.
pub async fn run_until<F>(
    config: &Config,
    sources: Vec<Arc<dyn EventSource>>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    let root = absolute(&config.root_dir())?;
    let metadata = tokio::fs::metadata(&root)
        .await
        .with_context(|| format!("root directory {} is not accessible", root.display()))?;
    if !metadata.is_dir() {
        anyhow::bail!("root path {} is not a directory", root.display());
    }

    let db_path = config.db_path();
    let store = Arc::new(
        SqliteStore::open(&db_path, config.busy_timeout())
            .with_context(|| format!("failed to open database {}", db_path.display()))?,
    );
    let metrics = Arc::new(PipelineMetrics::new().context("failed to build metrics registry")?);
    let cursors = Arc::new(CursorStore::load(absolute(&config.cursor_path())?).await);

    let batch_size = resolve_batch_size(config.storage.batch_size);
    let settings = TrackerSettings {
        root: root.clone(),
        scan_interval: config.scan_interval(),
        max_concurrent_files: config.tracker.max_concurrent_files,
        pipeline: config.pipeline_settings(batch_size),
    };

    info!(
        root = %root.display(),
        database = %db_path.display(),
        cursor_file = %cursors.path().display(),
        known_files = cursors.len(),
        batch_size,
        "log-ingest-agent starting"
    );

    let cancel_token = CancellationToken::new();
    let record_store: Arc<dyn RecordStore> = store.clone();

    let tracker = Arc::new(Tracker::new(
        settings,
        cursors,
        record_store.clone(),
        metrics.clone(),
    ));
    let mut tracker_handle = {
        let tracker = tracker.clone();
        let cancel_token = cancel_token.clone();
        tokio::spawn(async move { tracker.run(cancel_token).await })
    };

    let mut event_handles: Vec<(String, JoinHandle<()>)> = Vec::new();
    let mut sink_handle = None;
    if config.events.enabled {
        let (event_tx, event_rx) = event_channel(config.events.queue_capacity);
        sink_handle = Some(tokio::spawn(run_event_sink(
            event_rx,
            record_store.clone(),
            metrics.clone(),
            cancel_token.clone(),
        )));
        for source in sources {
            let name = source.name().to_string();
            let handle = tokio::spawn(run_event_source(
                source,
                config.event_poll_interval(),
                event_tx.clone(),
                cancel_token.clone(),
            ));
            event_handles.push((name, handle));
        }
    } else if !sources.is_empty() {
        warn!(
            sources = sources.len(),
            "event sources configured but events are disabled; ignoring them"
        );
    }

    tokio::pin!(shutdown);
    let shutdown_reason = tokio::select! {
        _ = &mut shutdown => "signal",
        res = &mut tracker_handle => {
            if let Err(err) = res {
                error!(error = %err, "tracker task failed");
            }
            "tracker exited"
        }
    };

    info!(reason = shutdown_reason, "initiating shutdown");
    cancel_token.cancel();

    if !tracker_handle.is_finished() {
        await_or_abort("tracker", tracker_handle).await;
    }
    for (name, handle) in event_handles {
        await_or_abort(&name, handle).await;
    }
    if let Some(handle) = sink_handle {
        await_or_abort("event sink", handle).await;
    }

    info!(
        records = store.record_count().await.unwrap_or_default(),
        events = store.event_count().await.unwrap_or_default(),
        "log-ingest-agent stopped"
    );
    Ok(())
}

async fn await_or_abort(task: &str, mut handle: JoinHandle<()>) {
    let timeout = sleep(SHUTDOWN_TIMEOUT);
    tokio::pin!(timeout);

    let result = tokio::select! {
        res = &mut handle => Some(res),
        _ = &mut timeout => None,
    };

    match result {
        Some(Ok(())) => info!(task, "task stopped"),
        Some(Err(err)) => warn!(task, error = %err, "task exited with error during shutdown"),
        None => {
            warn!(task, "task did not stop within timeout; aborting");
            handle.abort();
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("failed to resolve working directory")?;
    Ok(cwd.join(path))
}
