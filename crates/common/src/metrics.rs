//! Metrics collection for blockfeed.
//!
//! Counters for the job pipeline, the outbox, change capture and the
//! search indexer. Exposed through the ops endpoint in Prometheus format.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics instance.
static METRICS: std::sync::OnceLock<Arc<Metrics>> = std::sync::OnceLock::new();

/// Get the global metrics instance.
pub fn get_metrics() -> &'static Arc<Metrics> {
    METRICS.get_or_init(|| Arc::new(Metrics::new()))
}

/// Pipeline metrics collector.
#[derive(Debug, Default)]
pub struct Metrics {
    // === Job Queue Metrics ===
    /// Jobs accepted by the broker
    pub jobs_enqueued: AtomicU64,
    /// Jobs whose `process` succeeded
    pub jobs_completed: AtomicU64,
    /// Handler executions that failed
    pub jobs_failed: AtomicU64,
    /// Failed jobs scheduled for redelivery
    pub jobs_retried: AtomicU64,
    /// Jobs that exhausted their retry budget
    pub jobs_dead_lettered: AtomicU64,

    // === Outbox Metrics ===
    /// Publish failures captured in the outbox
    pub outbox_captured: AtomicU64,
    /// Outbox records republished
    pub outbox_republished: AtomicU64,

    // === Change Capture Metrics ===
    /// Change records received
    pub cdc_changes_received: AtomicU64,
    /// Domain jobs emitted by change handlers
    pub cdc_jobs_emitted: AtomicU64,

    // === Search Index Metrics ===
    /// Documents written (indexed or deleted)
    pub index_docs_written: AtomicU64,
    /// Items rejected by the index and dropped
    pub index_items_rejected: AtomicU64,
    /// Bulk retries caused by transient failures
    pub index_batches_retried: AtomicU64,

    // === Join Metrics ===
    /// Records joined to their dependency
    pub joins_completed: AtomicU64,
    /// Joins abandoned after the attempt budget
    pub joins_abandoned: AtomicU64,
}

/// Increment a counter by one.
pub fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Increment a counter by `n`.
pub fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl Metrics {
    /// Create a new metrics instance with all counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            jobs_enqueued: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_retried: AtomicU64::new(0),
            jobs_dead_lettered: AtomicU64::new(0),
            outbox_captured: AtomicU64::new(0),
            outbox_republished: AtomicU64::new(0),
            cdc_changes_received: AtomicU64::new(0),
            cdc_jobs_emitted: AtomicU64::new(0),
            index_docs_written: AtomicU64::new(0),
            index_items_rejected: AtomicU64::new(0),
            index_batches_retried: AtomicU64::new(0),
            joins_completed: AtomicU64::new(0),
            joins_abandoned: AtomicU64::new(0),
        }
    }

    /// Get a snapshot of all metrics.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_enqueued: self.jobs_enqueued.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_retried: self.jobs_retried.load(Ordering::Relaxed),
            jobs_dead_lettered: self.jobs_dead_lettered.load(Ordering::Relaxed),
            outbox_captured: self.outbox_captured.load(Ordering::Relaxed),
            outbox_republished: self.outbox_republished.load(Ordering::Relaxed),
            cdc_changes_received: self.cdc_changes_received.load(Ordering::Relaxed),
            cdc_jobs_emitted: self.cdc_jobs_emitted.load(Ordering::Relaxed),
            index_docs_written: self.index_docs_written.load(Ordering::Relaxed),
            index_items_rejected: self.index_items_rejected.load(Ordering::Relaxed),
            index_batches_retried: self.index_batches_retried.load(Ordering::Relaxed),
            joins_completed: self.joins_completed.load(Ordering::Relaxed),
            joins_abandoned: self.joins_abandoned.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut output = String::new();

        let counters = [
            ("jobs_enqueued_total", "Jobs accepted by the broker", snapshot.jobs_enqueued),
            ("jobs_completed_total", "Jobs processed successfully", snapshot.jobs_completed),
            ("jobs_failed_total", "Failed handler executions", snapshot.jobs_failed),
            ("jobs_retried_total", "Jobs scheduled for redelivery", snapshot.jobs_retried),
            (
                "jobs_dead_lettered_total",
                "Jobs that exhausted their retries",
                snapshot.jobs_dead_lettered,
            ),
            ("outbox_captured_total", "Publish failures captured", snapshot.outbox_captured),
            (
                "outbox_republished_total",
                "Outbox records republished",
                snapshot.outbox_republished,
            ),
            (
                "cdc_changes_received_total",
                "Change records received",
                snapshot.cdc_changes_received,
            ),
            ("cdc_jobs_emitted_total", "Jobs emitted by change capture", snapshot.cdc_jobs_emitted),
            ("index_docs_written_total", "Search documents written", snapshot.index_docs_written),
            (
                "index_items_rejected_total",
                "Search items rejected and dropped",
                snapshot.index_items_rejected,
            ),
            (
                "index_batches_retried_total",
                "Bulk requests retried",
                snapshot.index_batches_retried,
            ),
            ("joins_completed_total", "Records joined", snapshot.joins_completed),
            ("joins_abandoned_total", "Joins abandoned", snapshot.joins_abandoned),
        ];

        for (name, help, value) in counters {
            output.push_str(&format!("# HELP blockfeed_{name} {help}\n"));
            output.push_str(&format!("# TYPE blockfeed_{name} counter\n"));
            output.push_str(&format!("blockfeed_{name} {value}\n"));
        }

        output
    }
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Default, serde::Serialize)]
#[allow(missing_docs)]
pub struct MetricsSnapshot {
    pub jobs_enqueued: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub outbox_captured: u64,
    pub outbox_republished: u64,
    pub cdc_changes_received: u64,
    pub cdc_jobs_emitted: u64,
    pub index_docs_written: u64,
    pub index_items_rejected: u64,
    pub index_batches_retried: u64,
    pub joins_completed: u64,
    pub joins_abandoned: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let metrics = Metrics::new();
        incr(&metrics.jobs_enqueued);
        incr(&metrics.jobs_enqueued);
        add(&metrics.index_docs_written, 40);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.jobs_enqueued, 2);
        assert_eq!(snapshot.index_docs_written, 40);
        assert_eq!(snapshot.jobs_dead_lettered, 0);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = Metrics::new();
        incr(&metrics.outbox_captured);

        let text = metrics.to_prometheus();
        assert!(text.contains("# TYPE blockfeed_outbox_captured_total counter"));
        assert!(text.contains("blockfeed_outbox_captured_total 1"));
    }
}
