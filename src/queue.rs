//! Deduplicating work queue.
//!
//! Keys, not events, are queued. The queue guarantees:
//!
//! - a key waiting in the queue is never queued twice
//! - a key being processed is never handed to a second worker
//! - a key added while it is being processed is queued again once the
//!   worker calls [`WorkQueue::done`]
//!
//! Failed keys come back through [`WorkQueue::add_rate_limited`], which
//! waits an exponentially growing per-key delay before re-adding them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use crate::object::ObjectKey;
use crate::resilience::RetryConfig;

/// What a worker is asked to reconcile.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueKey {
    /// One object of one kind.
    Object { kind: String, key: ObjectKey },
    /// A namespace that was created, changed or removed.
    Namespace(String),
}

impl QueueKey {
    pub fn object(kind: impl Into<String>, key: ObjectKey) -> Self {
        Self::Object {
            kind: kind.into(),
            key,
        }
    }

    pub fn namespace(name: impl Into<String>) -> Self {
        Self::Namespace(name.into())
    }

    /// Label used for metrics.
    pub fn kind_label(&self) -> &str {
        match self {
            Self::Object { kind, .. } => kind,
            Self::Namespace(_) => "Namespace",
        }
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object { kind, key } => write!(f, "{} {}", kind, key),
            Self::Namespace(name) => write!(f, "Namespace {}", name),
        }
    }
}

struct Inner<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, usize>,
    shutting_down: bool,
}

impl<K> Default for Inner<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            failures: HashMap::new(),
            shutting_down: false,
        }
    }
}

pub struct WorkQueue<K> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
    backoff: RetryConfig,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(backoff: RetryConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            backoff,
        }
    }

    /// Queue `key` unless it is already waiting.
    pub async fn add(&self, key: K) {
        let mut inner = self.inner.lock().await;
        if inner.shutting_down || inner.dirty.contains(&key) {
            return;
        }
        inner.dirty.insert(key.clone());
        if inner.processing.contains(&key) {
            // Re-queued by done()
            return;
        }
        inner.queue.push_back(key);
        drop(inner);
        self.notify.notify_one();
    }

    /// Wait for the next key. `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().await;
                if inner.shutting_down {
                    return None;
                }
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    let more = !inner.queue.is_empty();
                    drop(inner);
                    if more {
                        // Pass the baton; notify_one stores only one permit.
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark `key` as no longer being processed.
    pub async fn done(&self, key: &K) {
        let mut inner = self.inner.lock().await;
        inner.processing.remove(key);
        if inner.dirty.contains(key) && !inner.shutting_down {
            inner.queue.push_back(key.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Queue `key` after `delay`.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            queue.add(key).await;
        });
    }

    /// Queue `key` after its per-key backoff delay; returns the delay.
    pub async fn add_rate_limited(self: &Arc<Self>, key: K) -> Duration {
        let attempt = {
            let mut inner = self.inner.lock().await;
            let failures = inner.failures.entry(key.clone()).or_insert(0);
            *failures += 1;
            *failures
        };
        let delay = self.backoff.delay_for_attempt(attempt);
        self.add_after(key, delay);
        delay
    }

    /// Reset the backoff of `key`.
    pub async fn forget(&self, key: &K) {
        self.inner.lock().await.failures.remove(key);
    }

    /// How many consecutive failures `key` has recorded.
    pub async fn num_requeues(&self, key: &K) -> usize {
        self.inner
            .lock()
            .await
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Stop handing out keys. Blocked [`get`](Self::get) calls return `None`.
    pub async fn shutdown(&self) {
        self.inner.lock().await.shutting_down = true;
        self.notify.notify_waiters();
    }

    pub async fn is_shutting_down(&self) -> bool {
        self.inner.lock().await.shutting_down
    }

    /// Keys waiting to be handed out.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Keys currently held by workers.
    pub async fn in_flight(&self) -> usize {
        self.inner.lock().await.processing.len()
    }
}
