//! In-process [`ObjectStore`].
//!
//! Behaves like a namespaced API server as far as the engine can tell:
//! resource versions, finalizer-gated deletion, namespace termination and a
//! broadcast change signal. Faults can be injected per key (write conflicts)
//! and per namespace (every write fails), and object writes are counted so
//! tests can assert that a converged reconcile writes nothing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use super::{BoxFuture, ObjectStore, WatchEvent};
use crate::error::{StoreError, StoreResult};
use crate::object::{LabelSelector, Namespace, Object, ObjectKey, ObjectList};

const WATCH_CAPACITY: usize = 4096;

type StoreKey = (String, ObjectKey);

#[derive(Default)]
struct Faults {
    /// Remaining forced conflicts per object.
    conflicts: HashMap<StoreKey, usize>,
    /// Namespaces in which every object write fails.
    failing_namespaces: HashSet<String>,
    /// Every call fails.
    unavailable: bool,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<StoreKey, Object>,
    namespaces: BTreeMap<String, Namespace>,
    revision: u64,
    faults: Faults,
}

impl State {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn check_available(&self, operation: &str) -> StoreResult<()> {
        if self.faults.unavailable {
            return Err(StoreError::unavailable(operation, "injected outage"));
        }
        Ok(())
    }

    fn check_write(&mut self, operation: &str, kind: &str, key: &ObjectKey) -> StoreResult<()> {
        self.check_available(operation)?;
        if self.faults.failing_namespaces.contains(&key.namespace) {
            return Err(StoreError::unavailable(
                operation,
                format!("injected failure in namespace {}", key.namespace),
            ));
        }
        let store_key = (kind.to_string(), key.clone());
        if let Some(remaining) = self.faults.conflicts.get_mut(&store_key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::conflict(kind, key));
            }
        }
        Ok(())
    }

    /// Drop a terminating namespace once nothing is left in it.
    fn reap_namespace(&mut self, name: &str) -> bool {
        let terminating = self
            .namespaces
            .get(name)
            .map(Namespace::is_terminating)
            .unwrap_or(false);
        if !terminating {
            return false;
        }
        let occupied = self.objects.keys().any(|(_, key)| key.namespace == name);
        if occupied {
            return false;
        }
        self.namespaces.remove(name);
        true
    }
}

/// In-memory object store.
pub struct MemoryStore {
    state: RwLock<State>,
    events: broadcast::Sender<WatchEvent>,
    writes: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            state: RwLock::new(State::default()),
            events,
            writes: AtomicU64::new(0),
        }
    }

    fn notify(&self, event: WatchEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn notify_object(&self, kind: &str, key: &ObjectKey) {
        self.notify(WatchEvent::Object {
            kind: kind.to_string(),
            key: key.clone(),
        });
    }

    fn notify_namespace(&self, name: &str) {
        self.notify(WatchEvent::Namespace {
            name: name.to_string(),
        });
    }

    // =========================================================================
    // Namespace administration
    // =========================================================================

    /// Create a namespace (no-op if it exists).
    pub async fn create_namespace(&self, name: &str) {
        self.put_namespace(Namespace::new(name)).await;
    }

    /// Create or replace a namespace's labels.
    ///
    /// A terminating namespace keeps its deletion mark.
    pub async fn put_namespace(&self, namespace: Namespace) {
        let name = namespace.name.clone();
        {
            let mut state = self.state.write().await;
            let revision = state.next_revision();
            let deletion = state
                .namespaces
                .get(&name)
                .and_then(|ns| ns.deletion_timestamp);
            let mut namespace = namespace;
            namespace.resource_version = revision;
            namespace.deletion_timestamp = deletion;
            state.namespaces.insert(name.clone(), namespace);
        }
        self.notify_namespace(&name);
    }

    /// Set a single label on an existing namespace.
    pub async fn label_namespace(&self, name: &str, key: &str, value: &str) -> StoreResult<()> {
        {
            let mut state = self.state.write().await;
            let revision = state.next_revision();
            let ns = state
                .namespaces
                .get_mut(name)
                .ok_or_else(|| StoreError::not_found("Namespace", name))?;
            ns.labels.insert(key.to_string(), value.to_string());
            ns.resource_version = revision;
        }
        self.notify_namespace(name);
        Ok(())
    }

    /// Remove a label from an existing namespace.
    pub async fn unlabel_namespace(&self, name: &str, key: &str) -> StoreResult<()> {
        {
            let mut state = self.state.write().await;
            let revision = state.next_revision();
            let ns = state
                .namespaces
                .get_mut(name)
                .ok_or_else(|| StoreError::not_found("Namespace", name))?;
            ns.labels.remove(key);
            ns.resource_version = revision;
        }
        self.notify_namespace(name);
        Ok(())
    }

    /// Start tearing a namespace down.
    ///
    /// Every object inside is deleted; objects holding finalizers linger
    /// (marked deleting) and keep the namespace terminating until their
    /// finalizers are gone.
    pub async fn delete_namespace(&self, name: &str) -> StoreResult<()> {
        let mut touched = Vec::new();
        {
            let mut state = self.state.write().await;
            if !state.namespaces.contains_key(name) {
                return Err(StoreError::not_found("Namespace", name));
            }
            let revision = state.next_revision();
            if let Some(ns) = state.namespaces.get_mut(name) {
                ns.deletion_timestamp.get_or_insert_with(SystemTime::now);
                ns.resource_version = revision;
            }

            let keys: Vec<StoreKey> = state
                .objects
                .keys()
                .filter(|(_, key)| key.namespace == name)
                .cloned()
                .collect();
            for store_key in keys {
                let revision = state.next_revision();
                let gated = state
                    .objects
                    .get(&store_key)
                    .map(|obj| !obj.metadata.finalizers.is_empty())
                    .unwrap_or(false);
                if gated {
                    if let Some(obj) = state.objects.get_mut(&store_key) {
                        obj.metadata.deletion_timestamp.get_or_insert_with(SystemTime::now);
                        obj.metadata.resource_version = revision;
                    }
                } else {
                    state.objects.remove(&store_key);
                }
                touched.push(store_key);
            }
            state.reap_namespace(name);
        }

        debug!(namespace = %name, objects = touched.len(), "Namespace deletion started");
        self.notify_namespace(name);
        for (kind, key) in &touched {
            self.notify_object(kind, key);
        }
        Ok(())
    }

    // =========================================================================
    // Fault injection & inspection
    // =========================================================================

    /// Make the next `count` writes to `kind` `key` fail with a conflict.
    pub async fn inject_conflicts(&self, kind: &str, key: &ObjectKey, count: usize) {
        let mut state = self.state.write().await;
        state
            .faults
            .conflicts
            .insert((kind.to_string(), key.clone()), count);
    }

    /// Make every object write in `namespace` fail until cleared.
    pub async fn fail_namespace(&self, namespace: &str) {
        let mut state = self.state.write().await;
        state.faults.failing_namespaces.insert(namespace.to_string());
    }

    pub async fn heal_namespace(&self, namespace: &str) {
        let mut state = self.state.write().await;
        state.faults.failing_namespaces.remove(namespace);
    }

    /// Make every call fail (or succeed again).
    pub async fn set_unavailable(&self, unavailable: bool) {
        let mut state = self.state.write().await;
        state.faults.unavailable = unavailable;
    }

    /// Number of object writes (create, update, delete) that succeeded.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn reset_write_count(&self) {
        self.writes.store(0, Ordering::SeqCst);
    }

    /// Every object of `kind`, across namespaces, sorted by key.
    pub async fn objects_of(&self, kind: &str) -> Vec<Object> {
        let state = self.state.read().await;
        state
            .objects
            .iter()
            .filter(|((k, _), _)| k == kind)
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

impl ObjectStore for MemoryStore {
    fn get<'a>(&'a self, kind: &'a str, key: &'a ObjectKey) -> BoxFuture<'a, Option<Object>> {
        Box::pin(async move {
            let state = self.state.read().await;
            state.check_available("get")?;
            Ok(state.objects.get(&(kind.to_string(), key.clone())).cloned())
        })
    }

    fn list<'a>(
        &'a self,
        kind: &'a str,
        selector: &'a LabelSelector,
        namespace: Option<&'a str>,
    ) -> BoxFuture<'a, ObjectList> {
        Box::pin(async move {
            let state = self.state.read().await;
            state.check_available("list")?;
            let items = state
                .objects
                .iter()
                .filter(|((k, key), _)| {
                    k == kind && namespace.map(|ns| key.namespace == ns).unwrap_or(true)
                })
                .filter(|(_, obj)| selector.matches(&obj.metadata.labels))
                .map(|(_, obj)| obj.clone())
                .collect();
            Ok(ObjectList {
                kind: kind.to_string(),
                items,
            })
        })
    }

    fn create(&self, object: Object) -> BoxFuture<'_, Object> {
        Box::pin(async move {
            let kind = object.kind.clone();
            let key = object.key();
            let stored = {
                let mut state = self.state.write().await;
                state.check_write("create", &kind, &key)?;

                match state.namespaces.get(&key.namespace) {
                    None => return Err(StoreError::not_found("Namespace", &key.namespace)),
                    Some(ns) if ns.is_terminating() => {
                        return Err(StoreError::unavailable(
                            "create",
                            format!("namespace {} is terminating", key.namespace),
                        ))
                    }
                    Some(_) => {}
                }

                let store_key = (kind.clone(), key.clone());
                if state.objects.contains_key(&store_key) {
                    return Err(StoreError::AlreadyExists {
                        kind: kind.clone(),
                        key: key.to_string(),
                    });
                }

                let mut object = object;
                object.metadata.resource_version = state.next_revision();
                object.metadata.deletion_timestamp = None;
                state.objects.insert(store_key, object.clone());
                object
            };

            self.record_write();
            self.notify_object(&kind, &key);
            Ok(stored)
        })
    }

    fn update(&self, object: Object) -> BoxFuture<'_, Object> {
        Box::pin(async move {
            let kind = object.kind.clone();
            let key = object.key();
            let (stored, reaped) = {
                let mut state = self.state.write().await;
                state.check_write("update", &kind, &key)?;

                let store_key = (kind.clone(), key.clone());
                let current = state
                    .objects
                    .get(&store_key)
                    .ok_or_else(|| StoreError::not_found(&kind, &key))?;
                if current.metadata.resource_version != object.metadata.resource_version {
                    return Err(StoreError::conflict(&kind, &key));
                }
                let deletion = current.metadata.deletion_timestamp;

                let mut object = object;
                object.metadata.resource_version = state.next_revision();
                object.metadata.deletion_timestamp = deletion;

                let mut reaped = false;
                if object.is_deleting() && object.metadata.finalizers.is_empty() {
                    state.objects.remove(&store_key);
                    reaped = state.reap_namespace(&key.namespace);
                } else {
                    state.objects.insert(store_key, object.clone());
                }
                (object, reaped)
            };

            self.record_write();
            self.notify_object(&kind, &key);
            if reaped {
                self.notify_namespace(&key.namespace);
            }
            Ok(stored)
        })
    }

    fn delete<'a>(&'a self, kind: &'a str, key: &'a ObjectKey) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let reaped = {
                let mut state = self.state.write().await;
                state.check_write("delete", kind, key)?;

                let store_key = (kind.to_string(), key.clone());
                let gated = match state.objects.get(&store_key) {
                    None => return Err(StoreError::not_found(kind, key)),
                    Some(obj) => !obj.metadata.finalizers.is_empty(),
                };

                if gated {
                    let revision = state.next_revision();
                    if let Some(obj) = state.objects.get_mut(&store_key) {
                        if obj.metadata.deletion_timestamp.is_none() {
                            obj.metadata.deletion_timestamp = Some(SystemTime::now());
                            obj.metadata.resource_version = revision;
                        }
                    }
                    false
                } else {
                    state.objects.remove(&store_key);
                    state.reap_namespace(&key.namespace)
                }
            };

            self.record_write();
            self.notify_object(kind, key);
            if reaped {
                self.notify_namespace(&key.namespace);
            }
            Ok(())
        })
    }

    fn get_namespace<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Option<Namespace>> {
        Box::pin(async move {
            let state = self.state.read().await;
            state.check_available("get_namespace")?;
            Ok(state.namespaces.get(name).cloned())
        })
    }

    fn list_namespaces(&self) -> BoxFuture<'_, Vec<Namespace>> {
        Box::pin(async move {
            let state = self.state.read().await;
            state.check_available("list_namespaces")?;
            Ok(state.namespaces.values().cloned().collect())
        })
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}
