//! Flat metric events from upstream pollers and the queue that carries them to
//! storage.
//!
//! Producers push onto a bounded channel and wait when it is full; a single sink
//! task drains it in arrival order.

use crate::metrics::PipelineMetrics;
use crate::storage::RecordStore;
use crate::tracker::sleep_or_cancel;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Unix seconds.
    pub timestamp: i64,
    pub source: String,
    pub key: String,
    pub event: String,
    pub value: i64,
}

impl Event {
    pub fn new(
        timestamp: i64,
        source: impl Into<String>,
        key: impl Into<String>,
        event: impl Into<String>,
        value: i64,
    ) -> Self {
        Self {
            timestamp,
            source: source.into(),
            key: key.into(),
            event: event.into(),
            value,
        }
    }
}

pub fn event_channel(capacity: usize) -> (mpsc::Sender<Event>, mpsc::Receiver<Event>) {
    mpsc::channel(capacity.max(1))
}

/// Something that can be polled for a fresh set of events, e.g. an HTTP stats API.
#[async_trait]
pub trait EventSource: Send + Sync {
    fn name(&self) -> &str;

    async fn poll(&self) -> Result<Vec<Event>>;
}

/// Poll `source` every `interval` and forward what it returns. A failed poll is
/// logged and retried on the next tick.
pub async fn run_event_source(
    source: Arc<dyn EventSource>,
    interval: Duration,
    event_tx: mpsc::Sender<Event>,
    cancel_token: CancellationToken,
) {
    info!(source = source.name(), ?interval, "starting event source");

    loop {
        match source.poll().await {
            Ok(events) => {
                debug!(source = source.name(), count = events.len(), "polled events");
                for event in events {
                    let sent = tokio::select! {
                        biased;
                        _ = cancel_token.cancelled() => return,
                        sent = event_tx.send(event) => sent,
                    };
                    if sent.is_err() {
                        warn!(source = source.name(), "event queue closed; stopping source");
                        return;
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, source = source.name(), "event poll failed");
            }
        }

        if sleep_or_cancel(interval, &cancel_token).await {
            return;
        }
    }
}

/// Drain the event queue into storage until every sender is dropped or the
/// token is cancelled. Events already queued at cancellation are still written.
pub async fn run_event_sink(
    mut event_rx: mpsc::Receiver<Event>,
    store: Arc<dyn RecordStore>,
    metrics: Arc<PipelineMetrics>,
    cancel_token: CancellationToken,
) {
    loop {
        let maybe_event = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                event_rx.close();
                while let Ok(event) = event_rx.try_recv() {
                    store_event(store.as_ref(), &metrics, event).await;
                }
                break;
            }
            maybe_event = event_rx.recv() => maybe_event,
        };

        match maybe_event {
            Some(event) => store_event(store.as_ref(), &metrics, event).await,
            None => break,
        }
    }
    info!("event sink stopped");
}

async fn store_event(store: &dyn RecordStore, metrics: &PipelineMetrics, event: Event) {
    let source = event.source.clone();
    let name = event.event.clone();
    match store.insert_event(event).await {
        Ok(()) => metrics.events_inserted_total.inc(),
        Err(err) => {
            metrics.event_errors_total.inc();
            error!(error = %err, %source, event = %name, "failed to insert event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{SqliteStore, DEFAULT_BUSY_TIMEOUT};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    struct CountingSource {
        polls: AtomicU32,
    }

    #[async_trait]
    impl EventSource for CountingSource {
        fn name(&self) -> &str {
            "counting"
        }

        async fn poll(&self) -> Result<Vec<Event>> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst) as i64;
            if n == 1 {
                anyhow::bail!("upstream unavailable");
            }
            Ok(vec![Event::new(n, "counting", "repo", "stars", n)])
        }
    }

    #[tokio::test]
    async fn producer_blocks_when_queue_is_full() {
        let (tx, mut rx) = event_channel(1);
        tx.send(Event::new(1, "s", "k", "e", 1)).await.expect("send");

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            tx.send(Event::new(2, "s", "k", "e", 2)),
        )
        .await;
        assert!(blocked.is_err(), "second send should wait for capacity");

        assert_eq!(rx.recv().await.expect("event").value, 1);
        tx.send(Event::new(3, "s", "k", "e", 3)).await.expect("send");
        assert_eq!(rx.recv().await.expect("event").value, 3);
    }

    #[tokio::test]
    async fn sink_drains_queue_into_storage() {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(
            SqliteStore::open(dir.path().join("db.sqlite"), DEFAULT_BUSY_TIMEOUT).expect("open"),
        );
        let metrics = Arc::new(PipelineMetrics::new().expect("metrics"));
        let (tx, rx) = event_channel(4);

        let sink = tokio::spawn(run_event_sink(
            rx,
            store.clone(),
            metrics.clone(),
            CancellationToken::new(),
        ));
        for value in 0..10 {
            tx.send(Event::new(value, "discord", "guild", "members", value))
                .await
                .expect("send");
        }
        drop(tx);
        sink.await.expect("join");

        assert_eq!(store.event_count().await.expect("count"), 10);
        assert_eq!(metrics.events_inserted_total.get(), 10);
    }

    #[tokio::test]
    async fn source_survives_failed_polls_and_stops_on_cancel() {
        let source = Arc::new(CountingSource {
            polls: AtomicU32::new(0),
        });
        let (tx, mut rx) = event_channel(8);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_event_source(
            source.clone(),
            Duration::from_millis(5),
            tx,
            cancel.clone(),
        ));

        let first = rx.recv().await.expect("first event");
        let second = rx.recv().await.expect("second event");
        assert_eq!(first.value, 0);
        assert_eq!(second.value, 2);

        cancel.cancel();
        handle.await.expect("join");
    }
}
