//! Prometheus metrics for the ingestion pipeline.
//!
//! Metrics live in a registry owned by [`PipelineMetrics`] rather than the
//! process-wide default registry. The runner builds one instance and hands an
//! `Arc` to every component that records into it.
//!
//! Naming follows the usual conventions:
//! - Histograms: *_seconds (for latency)
//! - Counters: *_total (for counts)

use anyhow::{Context, Result};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

pub struct PipelineMetrics {
    registry: Registry,

    // ==================== LATENCY METRICS ====================
    pub flush_duration: HistogramVec,
    pub cycle_duration: HistogramVec,

    // ==================== THROUGHPUT METRICS ====================
    pub lines_read_total: IntCounter,
    pub records_inserted_total: IntCounter,
    pub records_duplicate_total: IntCounter,
    pub batches_flushed_total: IntCounterVec,
    pub events_inserted_total: IntCounter,

    // ==================== ERROR COUNTERS ====================
    pub lines_rejected_total: IntCounterVec,
    pub oversized_lines_total: IntCounter,
    pub file_errors_total: IntCounterVec,
    pub cursor_saves_total: IntCounterVec,
    pub cycles_total: IntCounterVec,
    pub event_errors_total: IntCounter,

    // ==================== GAUGE METRICS ====================
    pub files_last_cycle: IntGauge,
}

impl PipelineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("log_ingest".to_string()), None)
            .context("failed to create metrics registry")?;

        let flush_duration = HistogramVec::new(
            HistogramOpts::new(
                "flush_duration_seconds",
                "Time spent committing one batch to storage",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 60.0]),
            &["status"],
        )?;
        let cycle_duration = HistogramVec::new(
            HistogramOpts::new("cycle_duration_seconds", "Wall time of one scan cycle")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
            &["status"],
        )?;
        let lines_read_total = IntCounter::new(
            "lines_read_total",
            "Complete lines read from tracked files",
        )?;
        let records_inserted_total =
            IntCounter::new("records_inserted_total", "Records newly written to storage")?;
        let records_duplicate_total = IntCounter::new(
            "records_duplicate_total",
            "Records skipped by storage because their fingerprint already existed",
        )?;
        let batches_flushed_total = IntCounterVec::new(
            Opts::new("batches_flushed_total", "Batches flushed to storage"),
            &["status"],
        )?;
        let events_inserted_total =
            IntCounter::new("events_inserted_total", "Upstream events written to storage")?;
        let lines_rejected_total = IntCounterVec::new(
            Opts::new("lines_rejected_total", "Lines rejected by the record parser"),
            &["reason"],
        )?;
        let oversized_lines_total = IntCounter::new(
            "oversized_lines_total",
            "Lines skipped because they exceeded the configured maximum length",
        )?;
        let file_errors_total = IntCounterVec::new(
            Opts::new("file_errors_total", "Per-file pipeline failures"),
            &["stage"],
        )?;
        let cursor_saves_total = IntCounterVec::new(
            Opts::new("cursor_saves_total", "Cursor state persistence attempts"),
            &["status"],
        )?;
        let cycles_total = IntCounterVec::new(
            Opts::new("cycles_total", "Scan cycles by outcome"),
            &["status"],
        )?;
        let event_errors_total =
            IntCounter::new("event_errors_total", "Upstream events that failed to persist")?;
        let files_last_cycle = IntGauge::new(
            "files_last_cycle",
            "Number of files discovered by the most recent scan cycle",
        )?;

        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(cycle_duration.clone()))?;
        registry.register(Box::new(lines_read_total.clone()))?;
        registry.register(Box::new(records_inserted_total.clone()))?;
        registry.register(Box::new(records_duplicate_total.clone()))?;
        registry.register(Box::new(batches_flushed_total.clone()))?;
        registry.register(Box::new(events_inserted_total.clone()))?;
        registry.register(Box::new(lines_rejected_total.clone()))?;
        registry.register(Box::new(oversized_lines_total.clone()))?;
        registry.register(Box::new(file_errors_total.clone()))?;
        registry.register(Box::new(cursor_saves_total.clone()))?;
        registry.register(Box::new(cycles_total.clone()))?;
        registry.register(Box::new(event_errors_total.clone()))?;
        registry.register(Box::new(files_last_cycle.clone()))?;

        Ok(Self {
            registry,
            flush_duration,
            cycle_duration,
            lines_read_total,
            records_inserted_total,
            records_duplicate_total,
            batches_flushed_total,
            events_inserted_total,
            lines_rejected_total,
            oversized_lines_total,
            file_errors_total,
            cursor_saves_total,
            cycles_total,
            event_errors_total,
            files_last_cycle,
        })
    }

    /// Render every registered metric in the Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .context("failed to encode metrics")?;
        String::from_utf8(buffer).context("metrics output was not valid utf-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registries_are_independent() {
        let first = PipelineMetrics::new().expect("metrics");
        let second = PipelineMetrics::new().expect("metrics");

        first.lines_read_total.inc_by(3);

        assert_eq!(first.lines_read_total.get(), 3);
        assert_eq!(second.lines_read_total.get(), 0);
    }

    #[test]
    fn encode_text_uses_namespace() {
        let metrics = PipelineMetrics::new().expect("metrics");
        metrics.lines_rejected_total.with_label_values(&["empty"]).inc();

        let text = metrics.encode_text().expect("encode");
        assert!(text.contains("log_ingest_lines_rejected_total{reason=\"empty\"} 1"));
    }
}
