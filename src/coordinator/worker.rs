//! Worker pool.
//!
//! Each worker pulls one key at a time from the shared [`WorkQueue`],
//! reconciles it and reports back:
//! 1. Optional admission through the global token bucket
//! 2. `Reconciler::reconcile` against fresh store state
//! 3. Success: reset the key's backoff, queue any follow-up key
//! 4. Failure: requeue the key after its per-key backoff
//! 5. `done`, so a key re-added meanwhile goes back on the queue
//!
//! A worker exits once the queue is shut down. The key it holds at that
//! moment is finished first.

use crate::metrics;
use crate::queue::{QueueKey, WorkQueue};
use crate::reconciler::Reconciler;
use crate::resilience::RateLimiter;
use crate::store::ObjectStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info_span, warn, Instrument};

/// Run one worker until the queue shuts down.
pub(super) async fn run_worker<S: ObjectStore + ?Sized>(
    id: usize,
    reconciler: Arc<Reconciler<S>>,
    queue: Arc<WorkQueue<QueueKey>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    busy: Arc<AtomicUsize>,
) {
    let span = info_span!("worker", id);

    async move {
        debug!("Worker started");

        while let Some(key) = queue.get().await {
            if let Some(limiter) = &rate_limiter {
                limiter.acquire().await;
            }

            let now_busy = busy.fetch_add(1, Ordering::SeqCst) + 1;
            metrics::set_busy_workers(now_busy);

            process(&reconciler, &queue, &key).await;
            queue.done(&key).await;

            let now_busy = busy.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
            metrics::set_busy_workers(now_busy);
            metrics::set_queue_depth(queue.len().await);
        }

        debug!("Worker stopped");
    }
    .instrument(span)
    .await
}

/// Reconcile one key and settle its queue bookkeeping.
async fn process<S: ObjectStore + ?Sized>(
    reconciler: &Reconciler<S>,
    queue: &Arc<WorkQueue<QueueKey>>,
    key: &QueueKey,
) {
    let started = Instant::now();
    let kind = key.kind_label().to_string();
    let span = info_span!("reconcile", key = %key);

    match reconciler.reconcile(key).instrument(span).await {
        Ok(action) => {
            queue.forget(key).await;
            metrics::record_reconcile(&kind, action.label(), started.elapsed());
            if let Some(next) = action.follow_up() {
                debug!(%key, follow_up = %next, "Queueing follow-up");
                queue.add(next.clone()).await;
            }
        }
        Err(e) => {
            let delay = queue.add_rate_limited(key.clone()).await;
            let attempts = queue.num_requeues(key).await;
            metrics::record_reconcile(&kind, "error", started.elapsed());
            metrics::record_error(&kind, e.kind_label());
            metrics::record_requeue(&kind, delay);

            if e.is_retryable() {
                warn!(%key, error = %e, attempts, retry_in_ms = delay.as_millis() as u64,
                    "Reconcile failed, requeued");
            } else {
                error!(%key, error = %e, attempts, retry_in_ms = delay.as_millis() as u64,
                    "Reconcile failed, needs attention");
            }
        }
    }
}
