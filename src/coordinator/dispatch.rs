// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Trigger sources: watch dispatch and full resync.
//!
//! Both are thin adapters onto the one work queue. The dispatcher turns
//! store change signals into queue keys as they arrive. The resync task
//! lists everything once at startup (retrying until the store answers)
//! and again every `resync_interval`, which catches anything the watch
//! stream dropped.
//!
//! # Lagging
//!
//! The watch channel is bounded. When the dispatcher falls behind and the
//! channel reports skipped signals, it runs a full resync instead of
//! guessing which keys were lost.

use crate::error::Result;
use crate::keys::{ObjectType, ReplicationKeys};
use crate::metrics;
use crate::object::{LabelSelector, Object};
use crate::queue::{QueueKey, WorkQueue};
use crate::resilience::RetryConfig;
use crate::store::{ObjectStore, WatchEvent};
use super::EngineState;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// What the trigger sources need to know about the store.
pub(super) struct Scope<S: ObjectStore + ?Sized> {
    pub store: Arc<S>,
    pub keys: ReplicationKeys,
    pub kinds: Vec<String>,
    pub queue: Arc<WorkQueue<QueueKey>>,
}

impl<S: ObjectStore + ?Sized> Scope<S> {
    /// Map a change signal to the key a worker should reconcile.
    fn queue_key(&self, event: WatchEvent) -> Option<QueueKey> {
        match event {
            WatchEvent::Object { kind, key } if self.kinds.contains(&kind) => Some(QueueKey::object(kind, key)),
            WatchEvent::Object { .. } => None,
            WatchEvent::Namespace { name } => Some(QueueKey::namespace(name)),
        }
    }

    /// Marked objects, and unmarked ones still carrying our finalizer.
    fn is_relevant(&self, object: &Object) -> bool {
        !matches!(self.keys.object_type_of(&object.metadata.labels), ObjectType::Unmarked)
            || object.metadata.has_finalizer(self.keys.finalizer())
    }

    /// Enqueue every namespace and every relevant object of every kind.
    ///
    /// Returns the number of keys offered to the queue.
    pub async fn full_resync(&self) -> Result<usize> {
        let started = Instant::now();
        let mut enqueued = 0;

        for namespace in self.store.list_namespaces().await? {
            self.queue.add(QueueKey::namespace(namespace.name)).await;
            enqueued += 1;
        }

        let selector = LabelSelector::everything();
        for kind in &self.kinds {
            let listed = self.store.list(kind, &selector, None).await?;
            for object in listed.items.iter().filter(|o| self.is_relevant(o)) {
                self.queue.add(QueueKey::object(kind.clone(), object.key())).await;
                enqueued += 1;
            }
        }

        let duration = started.elapsed();
        metrics::record_full_resync(enqueued, duration);
        metrics::set_queue_depth(self.queue.len().await);
        debug!(enqueued, duration_ms = duration.as_millis() as u64, "Full resync enqueued");
        Ok(enqueued)
    }
}

/// Forward store change signals onto the queue until shutdown.
///
/// A closed watch stream means the engine can no longer see changes; the
/// engine is marked `Failed`.
pub(super) async fn run_dispatcher<S: ObjectStore + ?Sized>(
    scope: Arc<Scope<S>>,
    mut events: broadcast::Receiver<WatchEvent>,
    state_tx: Arc<watch::Sender<EngineState>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = info_span!("dispatcher");

    async move {
        // Mark initial shutdown value as seen so changed() only fires on actual changes
        let _ = shutdown_rx.borrow_and_update();
        info!(kinds = ?scope.kinds, "Starting watch dispatcher");

        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping dispatcher");
                        break;
                    }
                    continue;
                }

                received = events.recv() => match received {
                    Ok(event) => {
                        let source = match &event {
                            WatchEvent::Object { .. } => "object",
                            WatchEvent::Namespace { .. } => "namespace",
                        };
                        if let Some(key) = scope.queue_key(event) {
                            metrics::record_watch_event(source);
                            scope.queue.add(key).await;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Watch stream lagged, running full resync");
                        metrics::record_watch_lagged(skipped);
                        if let Err(e) = scope.full_resync().await {
                            // The periodic resync will try again.
                            warn!(error = %e, "Resync after lag failed");
                        }
                    }
                    Err(RecvError::Closed) => {
                        error!("Watch stream closed, engine can no longer observe changes");
                        let _ = state_tx.send(EngineState::Failed);
                        metrics::set_engine_state(EngineState::Failed.as_str());
                        break;
                    }
                }
            }
        }

        info!("Watch dispatcher stopped");
    }
    .instrument(span)
    .await
}

/// Initial list, then a full resync every `interval` until shutdown.
///
/// The initial list is retried with `retry` backoff until it succeeds, so
/// an engine started against an unavailable store catches up once the
/// store is back. `interval = None` disables the periodic part.
pub(super) async fn run_resync<S: ObjectStore + ?Sized>(
    scope: Arc<Scope<S>>,
    interval: Option<Duration>,
    retry: RetryConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = info_span!("resync");

    async move {
        let _ = shutdown_rx.borrow_and_update();

        let mut attempt = 0;
        loop {
            match scope.full_resync().await {
                Ok(enqueued) => {
                    info!(enqueued, "Initial resync complete");
                    break;
                }
                Err(e) => {
                    attempt += 1;
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(error = %e, attempt, retry_in_ms = delay.as_millis() as u64, "Initial resync failed");
                    tokio::select! {
                        biased;
                        result = shutdown_rx.changed() => {
                            if result.is_err() || *shutdown_rx.borrow() {
                                return;
                            }
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        let Some(interval) = interval else {
            debug!("Periodic resync disabled");
            return;
        };

        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        // Skip missed ticks instead of bursting to catch up
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping resync task");
                        break;
                    }
                    continue;
                }

                _ = timer.tick() => {}
            }

            if let Err(e) = scope.full_resync().await {
                warn!(error = %e, "Periodic resync failed");
            }
        }
    }
    .instrument(span)
    .await
}
