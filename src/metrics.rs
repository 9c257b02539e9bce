//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Reconcile outcomes and latency per kind
//! - Replica writes (created / updated / deleted)
//! - Optimistic concurrency retries
//! - Work queue depth and requeues
//! - Namespace resyncs and periodic full resyncs
//! - Engine state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `namespace_replicator_` and follow
//! Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use namespace_replicator::metrics;
//! use std::time::Duration;
//!
//! metrics::record_reconcile("Secret", "propagated", Duration::from_millis(12));
//! metrics::record_replica_write("Secret", "created");
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Reconcile Metrics
// =============================================================================

/// Record one finished reconcile.
pub fn record_reconcile(kind: &str, outcome: &str, duration: Duration) {
    counter!(
        "namespace_replicator_reconciles_total",
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("namespace_replicator_reconcile_duration_seconds", "kind" => kind.to_string())
        .record(duration.as_secs_f64());
}

/// Record a failed reconcile by error class.
pub fn record_error(kind: &str, error_type: &str) {
    counter!(
        "namespace_replicator_errors_total",
        "kind" => kind.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record a write against a replica.
///
/// `action` is one of `created`, `updated`, `deleted`, `released`.
pub fn record_replica_write(kind: &str, action: &str) {
    counter!(
        "namespace_replicator_replica_writes_total",
        "kind" => kind.to_string(),
        "action" => action.to_string()
    )
    .increment(1);
}

/// Record a target skipped because it is itself a source.
pub fn record_replica_skipped(kind: &str) {
    counter!("namespace_replicator_replica_skips_total", "kind" => kind.to_string()).increment(1);
}

/// Record a write retried after an optimistic concurrency conflict.
pub fn record_conflict_retry() {
    counter!("namespace_replicator_conflict_retries_total").increment(1);
}

/// Record a finalizer add or remove that resulted in a write.
pub fn record_finalizer_write(operation: &str) {
    counter!("namespace_replicator_finalizer_writes_total", "operation" => operation.to_string())
        .increment(1);
}

// =============================================================================
// Queue Metrics
// =============================================================================

/// Gauge for keys waiting in the work queue.
pub fn set_queue_depth(depth: usize) {
    gauge!("namespace_replicator_queue_depth").set(depth as f64);
}

/// Record a key put back with backoff after a failure.
pub fn record_requeue(kind: &str, delay: Duration) {
    counter!("namespace_replicator_requeues_total", "kind" => kind.to_string()).increment(1);
    histogram!("namespace_replicator_requeue_delay_seconds").record(delay.as_secs_f64());
}

/// Gauge for workers currently running a reconcile.
pub fn set_busy_workers(count: usize) {
    gauge!("namespace_replicator_busy_workers").set(count as f64);
}

// =============================================================================
// Trigger Metrics
// =============================================================================

/// Record a change signal received from the store.
pub fn record_watch_event(source: &str) {
    counter!("namespace_replicator_watch_events_total", "source" => source.to_string()).increment(1);
}

/// Record change signals lost because the dispatcher fell behind.
pub fn record_watch_lagged(skipped: u64) {
    counter!("namespace_replicator_watch_lagged_total").increment(skipped);
}

/// Record one namespace-driven resync.
pub fn record_namespace_resync(outcome: &str) {
    counter!("namespace_replicator_namespace_resyncs_total", "outcome" => outcome.to_string())
        .increment(1);
}

/// Record a periodic full resync pass.
pub fn record_full_resync(keys_enqueued: usize, duration: Duration) {
    counter!("namespace_replicator_full_resyncs_total").increment(1);
    histogram!("namespace_replicator_full_resync_keys").record(keys_enqueued as f64);
    histogram!("namespace_replicator_full_resync_duration_seconds").record(duration.as_secs_f64());
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    // Encoded numerically for alerting
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        "Failed" => 4.0,
        _ => -1.0,
    };
    gauge!("namespace_replicator_engine_state").set(value);
}
