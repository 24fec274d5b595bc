//! Observability metrics for the execution engine.
//!
//! Metrics are exposed via the `metrics` crate facade; deployments install
//! the exporter of their choice (e.g. `metrics-exporter-prometheus`).
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `conflux_events_total` | Counter | `outcome` | Completion events processed |
//! | `conflux_lock_conflicts_total` | Counter | - | Optimistic-lock retries |
//! | `conflux_queue_retries_total` | Counter | `queue` | Queue publish retries |
//! | `conflux_dispatch_queue_depth` | Gauge | `queue` | Pending invocations |

use metrics::{counter, gauge};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: completion events processed, labeled by outcome.
    pub const EVENTS_TOTAL: &str = "conflux_events_total";
    /// Counter: optimistic-lock conflicts encountered while persisting.
    pub const LOCK_CONFLICTS_TOTAL: &str = "conflux_lock_conflicts_total";
    /// Counter: queue publish retries, labeled by queue.
    pub const QUEUE_RETRIES_TOTAL: &str = "conflux_queue_retries_total";
    /// Gauge: pending invocations per dispatch queue.
    pub const DISPATCH_QUEUE_DEPTH: &str = "conflux_dispatch_queue_depth";
}

/// Handle for recording engine metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineMetrics;

impl EngineMetrics {
    /// Creates a metrics handle.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records one processed completion event with its outcome label.
    pub fn record_event(&self, outcome: &'static str) {
        counter!(names::EVENTS_TOTAL, "outcome" => outcome).increment(1);
    }

    /// Records an optimistic-lock conflict.
    pub fn record_lock_conflict(&self) {
        counter!(names::LOCK_CONFLICTS_TOTAL).increment(1);
    }

    /// Records a queue publish retry.
    pub fn record_queue_retry(&self, queue: &str) {
        counter!(names::QUEUE_RETRIES_TOTAL, "queue" => queue.to_owned()).increment(1);
    }

    /// Updates the pending-invocation gauge for a queue.
    pub fn set_queue_depth(&self, queue: &str, depth: usize) {
        gauge!(names::DISPATCH_QUEUE_DEPTH, "queue" => queue.to_owned()).set(depth as f64);
    }
}
