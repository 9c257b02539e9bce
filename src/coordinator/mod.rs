// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine coordinator.
//!
//! The main orchestrator that ties together:
//! - The object store's change stream, via the watch dispatcher
//! - The deduplicating [`WorkQueue`] and a fixed worker pool
//! - The [`Reconciler`], which does the actual work per key
//! - Initial list plus periodic full resync
//!
//! # Architecture
//!
//! ```text
//!  store.watch() ──► dispatcher ──┐
//!                                 ├──► WorkQueue ──► worker × N ──► Reconciler ──► store
//!  resync timer ──► full_resync ──┘        ▲                │
//!                                          └── requeue ◄────┘ (error / follow-up)
//! ```
//!
//! Both trigger sources only name keys. Workers always re-read current
//! state, so a key queued by either path converges the same way.

mod dispatch;
mod types;
mod worker;

pub use types::{EngineState, HealthCheck};

use crate::config::ReplicatorConfig;
use crate::error::{ReplicatorError, Result};
use crate::events::{EventSink, LogEventSink};
use crate::metrics;
use crate::queue::{QueueKey, WorkQueue};
use crate::reconciler::Reconciler;
use crate::resilience::RateLimiter;
use crate::store::ObjectStore;
use dispatch::Scope;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// The main replication engine.
///
/// Owns the work queue and every background task. Construct with
/// [`new`](Self::new), then [`start`](Self::start); call
/// [`shutdown`](Self::shutdown) before dropping.
pub struct ReplicationEngine<S: ObjectStore + ?Sized> {
    config: ReplicatorConfig,

    store: Arc<S>,

    reconciler: Arc<Reconciler<S>>,

    queue: Arc<WorkQueue<QueueKey>>,

    /// Engine state (broadcast to watchers)
    state_tx: Arc<watch::Sender<EngineState>>,

    /// Engine state receiver (for internal use)
    state_rx: watch::Receiver<EngineState>,

    /// Shutdown signal sender
    shutdown_tx: watch::Sender<bool>,

    /// Shutdown signal receiver
    shutdown_rx: watch::Receiver<bool>,

    /// Workers currently holding a key
    busy: Arc<AtomicUsize>,

    /// Dispatcher, resync and worker task handles
    handles: RwLock<Vec<tokio::task::JoinHandle<()>>>,
}

impl<S: ObjectStore + ?Sized> ReplicationEngine<S> {
    /// Create a new engine over `store`.
    ///
    /// The engine starts in `Created` state. Fails if `config` does not
    /// validate or names a kind with no adapter.
    pub fn new(store: Arc<S>, config: ReplicatorConfig, events: Arc<dyn EventSink>) -> Result<Self> {
        let reconciler = Reconciler::new(store.clone(), &config, events)?;
        let queue = WorkQueue::new(config.settings.requeue.to_retry_config());

        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            store,
            reconciler: Arc::new(reconciler),
            queue: Arc::new(queue),
            state_tx: Arc::new(state_tx),
            state_rx,
            shutdown_tx,
            shutdown_rx,
            busy: Arc::new(AtomicUsize::new(0)),
            handles: RwLock::new(Vec::new()),
        })
    }

    /// Create an engine that reports replication events to the log.
    pub fn with_log_events(store: Arc<S>, config: ReplicatorConfig) -> Result<Self> {
        Self::new(store, config, Arc::new(LogEventSink))
    }

    /// Get the current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if engine is running.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    pub fn reconciler(&self) -> &Arc<Reconciler<S>> {
        &self.reconciler
    }

    /// Get a comprehensive health check.
    ///
    /// Performs no store I/O; everything comes from in-process state.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        HealthCheck {
            state,
            ready: state == EngineState::Running,
            healthy: state != EngineState::Failed,
            queue_depth: self.queue.len().await,
            in_flight: self.queue.in_flight().await,
            workers: self.config.settings.workers,
            kinds: self.reconciler.adapters().kinds(),
        }
    }

    /// Queue a key by hand, as if the store had signalled it.
    pub async fn enqueue(&self, key: QueueKey) {
        self.queue.add(key).await;
    }

    /// Keys waiting for a worker.
    pub async fn queue_len(&self) -> usize {
        self.queue.len().await
    }

    /// Wait until nothing is queued or being reconciled.
    ///
    /// Keys still waiting out a requeue backoff are not visible here.
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.queue.is_empty().await && self.queue.in_flight().await == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Start the engine.
    ///
    /// Subscribes to the store's change stream, spawns the worker pool,
    /// and kicks off the initial resync. Returns once everything is
    /// spawned; the initial resync completes in the background.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicatorError::InvalidState`] unless the engine is in
    /// `Created` state.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ReplicatorError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        let settings = &self.config.settings;
        let kinds = self.reconciler.adapters().kinds();

        info!(
            prefix = %self.config.key_prefix,
            kinds = ?kinds,
            workers = settings.workers,
            resync_interval = %settings.resync_interval,
            "Starting replication engine"
        );

        // Subscribe before the initial list so nothing falls in between.
        let events = self.store.watch();

        let scope = Arc::new(Scope {
            store: self.store.clone(),
            keys: self.config.keys(),
            kinds,
            queue: self.queue.clone(),
        });

        let rate_limiter = settings.rate_limit_config().map(|config| {
            info!(
                burst = config.burst_size,
                per_sec = config.refill_rate,
                "Reconcile rate limiting enabled"
            );
            Arc::new(RateLimiter::new(config))
        });

        let mut handles = Vec::with_capacity(settings.workers + 2);

        handles.push(tokio::spawn(dispatch::run_dispatcher(
            scope.clone(),
            events,
            self.state_tx.clone(),
            self.shutdown_rx.clone(),
        )));

        for id in 0..settings.workers {
            handles.push(tokio::spawn(worker::run_worker(
                id,
                self.reconciler.clone(),
                self.queue.clone(),
                rate_limiter.clone(),
                self.busy.clone(),
            )));
        }

        handles.push(tokio::spawn(dispatch::run_resync(
            scope,
            settings.resync_interval_duration(),
            settings.requeue.to_retry_config(),
            self.shutdown_rx.clone(),
        )));

        *self.handles.write().await = handles;

        // The dispatcher may already have marked the engine Failed.
        let running = self.state_tx.send_if_modified(|state| {
            if *state != EngineState::Created {
                return false;
            }
            *state = EngineState::Running;
            true
        });
        if running {
            metrics::set_engine_state(EngineState::Running.as_str());
            info!("Replication engine running");
        } else {
            warn!(state = %self.state(), "Engine left Created state during start-up");
        }

        Ok(())
    }

    /// Shutdown the engine gracefully.
    ///
    /// Stops intake, lets every worker finish the key it holds, and waits
    /// up to `shutdown_timeout` for the tasks to exit. Tasks still running
    /// after that are aborted.
    pub async fn shutdown(&mut self) {
        if self.state() == EngineState::Created {
            let _ = self.state_tx.send(EngineState::Stopped);
            metrics::set_engine_state(EngineState::Stopped.as_str());
            return;
        }

        info!("Shutting down replication engine");
        let _ = self.state_tx.send(EngineState::ShuttingDown);
        metrics::set_engine_state(EngineState::ShuttingDown.as_str());

        // Signal shutdown to all tasks
        let _ = self.shutdown_tx.send(true);
        self.queue.shutdown().await;

        let handles: Vec<_> = {
            let mut guard = self.handles.write().await;
            std::mem::take(&mut *guard)
        };

        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for tasks to finish");
        }

        let deadline = Instant::now() + self.config.settings.shutdown_timeout_duration();
        for (i, mut handle) in handles.into_iter().enumerate() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, &mut handle).await {
                Ok(Ok(())) => {
                    debug!(task = i + 1, "Task completed gracefully");
                }
                Ok(Err(e)) => {
                    warn!(task = i + 1, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    warn!(task = i + 1, "Task timed out during shutdown, aborting");
                    handle.abort();
                }
            }
        }

        metrics::set_busy_workers(0);
        metrics::set_queue_depth(0);

        let _ = self.state_tx.send(EngineState::Stopped);
        metrics::set_engine_state(EngineState::Stopped.as_str());
        info!("Replication engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventSink;
    use crate::object::{LabelSelector, Namespace, Object, ObjectKey, ObjectList};
    use crate::store::{BoxFuture, MemoryStore, WatchEvent};
    use tokio::sync::broadcast;

    fn engine() -> ReplicationEngine<MemoryStore> {
        ReplicationEngine::new(
            Arc::new(MemoryStore::new()),
            ReplicatorConfig::for_testing(),
            Arc::new(MemoryEventSink::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_engine_initial_state() {
        let engine = engine();
        assert_eq!(engine.state(), EngineState::Created);
        assert!(!engine.is_running());
    }

    #[test]
    fn test_engine_state_receiver() {
        let engine = engine();
        let state_rx = engine.state_receiver();
        assert_eq!(*state_rx.borrow(), EngineState::Created);
    }

    #[test]
    fn test_engine_rejects_invalid_config() {
        let mut config = ReplicatorConfig::for_testing();
        config.settings.workers = 0;
        let result = ReplicationEngine::with_log_events(Arc::new(MemoryStore::new()), config);
        assert!(matches!(result, Err(ReplicatorError::Config(_))));
    }

    #[tokio::test]
    async fn test_engine_start_invalid_state() {
        let mut engine = engine();

        // Force state to Running (simulating already started)
        let _ = engine.state_tx.send(EngineState::Running);

        let result = engine.start().await;
        if let Err(ReplicatorError::InvalidState { expected, actual }) = result {
            assert_eq!(expected, "Created");
            assert_eq!(actual, "Running");
        } else {
            panic!("Expected InvalidState error");
        }
    }

    #[tokio::test]
    async fn test_engine_shutdown_from_created() {
        let mut engine = engine();
        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_engine_start_and_shutdown() {
        let mut engine = engine();
        engine.start().await.unwrap();
        assert!(engine.is_running());

        let health = engine.health_check().await;
        assert!(health.ready);
        assert!(health.healthy);
        assert_eq!(health.workers, 4);
        assert_eq!(health.kinds.len(), 6);

        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(!engine.health_check().await.ready);

        // Not restartable.
        assert!(engine.start().await.is_err());
    }

    #[tokio::test]
    async fn test_engine_propagates_source() {
        let store = Arc::new(MemoryStore::new());
        store.put_namespace(Namespace::new("ns-a")).await;
        store.put_namespace(Namespace::new("ns-b")).await;

        let mut engine = ReplicationEngine::new(
            store.clone(),
            ReplicatorConfig::for_testing(),
            Arc::new(MemoryEventSink::new()),
        )
        .unwrap();
        engine.start().await.unwrap();

        store
            .create(Object::named("Secret", "ns-a", "S").with_label("replicator.io/object-type", "replicated"))
            .await
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let key = ObjectKey::new("ns-b", "S");
        while store.get("Secret", &key).await.unwrap().is_none() {
            assert!(Instant::now() < deadline, "replica never appeared");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        engine.shutdown().await;
    }

    /// A store whose change stream is closed from the start.
    struct ClosedWatchStore(MemoryStore);

    impl ObjectStore for ClosedWatchStore {
        fn get<'a>(&'a self, kind: &'a str, key: &'a ObjectKey) -> BoxFuture<'a, Option<Object>> {
            self.0.get(kind, key)
        }

        fn list<'a>(
            &'a self,
            kind: &'a str,
            selector: &'a LabelSelector,
            namespace: Option<&'a str>,
        ) -> BoxFuture<'a, ObjectList> {
            self.0.list(kind, selector, namespace)
        }

        fn create(&self, object: Object) -> BoxFuture<'_, Object> {
            self.0.create(object)
        }

        fn update(&self, object: Object) -> BoxFuture<'_, Object> {
            self.0.update(object)
        }

        fn delete<'a>(&'a self, kind: &'a str, key: &'a ObjectKey) -> BoxFuture<'a, ()> {
            self.0.delete(kind, key)
        }

        fn get_namespace<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Option<Namespace>> {
            self.0.get_namespace(name)
        }

        fn list_namespaces(&self) -> BoxFuture<'_, Vec<Namespace>> {
            self.0.list_namespaces()
        }

        fn watch(&self) -> broadcast::Receiver<WatchEvent> {
            let (_, rx) = broadcast::channel(1);
            rx
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_closed_watch_stays_failed() {
        let mut engine = ReplicationEngine::new(
            Arc::new(ClosedWatchStore(MemoryStore::new())),
            ReplicatorConfig::for_testing(),
            Arc::new(MemoryEventSink::new()),
        )
        .unwrap();
        engine.start().await.unwrap();

        let mut state_rx = engine.state_receiver();
        let failed = tokio::time::timeout(
            Duration::from_secs(5),
            state_rx.wait_for(|state| *state == EngineState::Failed),
        )
        .await
        .map(|waited| waited.is_ok())
        .unwrap_or(false);
        assert!(failed, "engine never failed");

        // start() must not have overwritten Failed with Running.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.state(), EngineState::Failed);
        assert!(!engine.health_check().await.healthy);

        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
    }
}
