// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Level-triggered reconciliation.
//!
//! [`Reconciler::reconcile`] takes a [`QueueKey`], re-reads current state
//! from the store and drives it one step toward "exactly one up-to-date
//! replica per eligible namespace". It never looks at what triggered it.
//!
//! # Classification
//!
//! ```text
//! object absent                       → NoOp
//! object-type=replica                 → replica validation   (replica.rs)
//! object-type=replicated, deleting    → source cleanup       (source.rs)
//! object-type=replicated              → source propagation   (source.rs)
//! unmarked / unknown, has finalizer   → source cleanup       (source.rs)
//! unmarked / unknown                  → NoOp
//! namespace key                       → namespace resync     (namespace.rs)
//! ```
//!
//! Both entry points (per object and per namespace) share the
//! [`write_replica`](Reconciler::write_replica) and
//! [`retire`](Reconciler::retire) helpers, so a namespace event and an
//! object event for the same pair converge to the same end state.

mod namespace;
mod replica;
mod source;

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::adapter::{AdapterRegistry, KindAdapter};
use crate::config::ReplicatorConfig;
use crate::eligibility::NamespaceFilter;
use crate::error::{NamespaceFailure, ReplicatorError, Result};
use crate::events::{self, EventSink, ReplicationEvent};
use crate::finalizer::FinalizerManager;
use crate::keys::{ObjectType, ReplicationKeys};
use crate::object::{Namespace, Object, ObjectKey};
use crate::queue::QueueKey;
use crate::resilience::RetryConfig;
use crate::store::{self, ObjectStore, OperationResult};

/// Per-namespace tallies of one fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutStats {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Targets left alone because they are sources themselves.
    pub skipped: usize,
    pub deleted: usize,
    /// Replicas whose finalizer was dropped.
    pub released: usize,
}

impl FanOutStats {
    pub fn record(&mut self, result: OperationResult) {
        match result {
            OperationResult::Created => self.created += 1,
            OperationResult::Updated => self.updated += 1,
            OperationResult::Unchanged => self.unchanged += 1,
            OperationResult::Skipped => self.skipped += 1,
        }
    }

    pub fn record_retire(&mut self, mode: RetireMode) {
        match mode {
            RetireMode::Deleted => self.deleted += 1,
            RetireMode::FinalizerReleased => self.released += 1,
            RetireMode::AlreadyGone => {}
        }
    }

    pub fn merge(&mut self, other: &FanOutStats) {
        self.created += other.created;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
        self.deleted += other.deleted;
        self.released += other.released;
    }

    /// Number of replica writes.
    pub fn writes(&self) -> usize {
        self.created + self.updated + self.deleted + self.released
    }
}

/// How a replica was taken out of service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireMode {
    /// A delete was requested; the finalizer is dropped on a later pass.
    Deleted,
    /// The replica was already deleting; its finalizer was dropped.
    FinalizerReleased,
    /// Nothing left to do.
    AlreadyGone,
}

/// What one reconcile did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    NoOp,
    Propagated(FanOutStats),
    CleanedUp(FanOutStats),
    ReplicaRetired {
        mode: RetireMode,
        /// Key to enqueue next (the source that must recreate this replica).
        follow_up: Option<QueueKey>,
    },
    NamespaceSynced(FanOutStats),
}

impl Action {
    pub fn follow_up(&self) -> Option<&QueueKey> {
        match self {
            Self::ReplicaRetired { follow_up, .. } => follow_up.as_ref(),
            _ => None,
        }
    }

    /// Label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::NoOp => "noop",
            Self::Propagated(_) => "propagated",
            Self::CleanedUp(_) => "cleaned_up",
            Self::ReplicaRetired { .. } => "replica_retired",
            Self::NamespaceSynced(_) => "namespace_synced",
        }
    }
}

/// The reconciliation engine.
pub struct Reconciler<S: ObjectStore + ?Sized> {
    store: Arc<S>,
    adapters: AdapterRegistry,
    keys: ReplicationKeys,
    filter: NamespaceFilter,
    finalizers: FinalizerManager,
    policy: RetryConfig,
    events: Arc<dyn EventSink>,
}

impl<S: ObjectStore + ?Sized> Reconciler<S> {
    pub fn new(store: Arc<S>, config: &ReplicatorConfig, events: Arc<dyn EventSink>) -> Result<Self> {
        config.validate()?;
        let keys = config.keys();
        let policy = config.settings.conflict_retry.to_retry_config();
        Ok(Self {
            store,
            adapters: config.adapters()?,
            filter: config.namespace_filter(),
            finalizers: FinalizerManager::new(keys.finalizer(), policy.clone()),
            keys,
            policy,
            events,
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    pub fn keys(&self) -> &ReplicationKeys {
        &self.keys
    }

    /// Reconcile one key against the current state of the store.
    pub async fn reconcile(&self, key: &QueueKey) -> Result<Action> {
        match key {
            QueueKey::Object { kind, key } => self.reconcile_object(kind, key).await,
            QueueKey::Namespace(name) => self.reconcile_namespace(name).await,
        }
    }

    async fn reconcile_object(&self, kind: &str, key: &ObjectKey) -> Result<Action> {
        let adapter = self.adapters.get(kind)?;
        let adapter = adapter.as_ref();

        let Some(object) = self.store.get(kind, key).await? else {
            debug!(%kind, %key, "Object gone, nothing to do");
            return Ok(Action::NoOp);
        };

        match self.keys.object_type_of(&object.metadata.labels) {
            ObjectType::Replica => self.validate_replica(adapter, &object).await,
            ObjectType::Replicated if object.is_deleting() => self.cleanup_source(adapter, &object).await,
            ObjectType::Replicated => self.propagate_source(adapter, &object).await,
            ObjectType::Unmarked | ObjectType::Unknown(_) => {
                if object.metadata.has_finalizer(self.keys.finalizer()) {
                    // Former source: marker removed or changed.
                    self.cleanup_source(adapter, &object).await
                } else {
                    Ok(Action::NoOp)
                }
            }
        }
    }

    // =========================================================================
    // Shared helpers
    // =========================================================================

    fn is_live_source(&self, object: &Object) -> bool {
        !object.is_deleting() && self.keys.object_type_of(&object.metadata.labels) == ObjectType::Replicated
    }

    /// Write `source`'s replica into every namespace of `targets`.
    ///
    /// Targets equal to the source's own namespace or not accepting replicas
    /// are skipped. Failures are collected per namespace.
    async fn propagate_to(
        &self,
        adapter: &dyn KindAdapter,
        source: &Object,
        targets: &[Namespace],
    ) -> (FanOutStats, Vec<NamespaceFailure>) {
        let writes = targets
            .iter()
            .filter(|ns| ns.name != source.metadata.namespace && self.filter.accepts_replicas(ns))
            .map(|ns| async move {
                let result = self.write_replica(adapter, source, &ns.name).await;
                (ns.name.as_str(), result)
            });

        let mut stats = FanOutStats::default();
        let mut failures = Vec::new();
        for (namespace, result) in join_all(writes).await {
            match result {
                Ok(outcome) => stats.record(outcome),
                Err(e) => failures.push(NamespaceFailure {
                    namespace: namespace.to_string(),
                    message: e.to_string(),
                }),
            }
        }
        (stats, failures)
    }

    /// Create or update the replica of `source` in `namespace`.
    async fn write_replica(
        &self,
        adapter: &dyn KindAdapter,
        source: &Object,
        namespace: &str,
    ) -> Result<OperationResult> {
        let kind = adapter.kind();
        let key = source.key().in_namespace(namespace);
        let keys = &self.keys;
        let finalizer = keys.finalizer();

        let result = store::create_or_update(
            self.store.as_ref(),
            adapter,
            &key,
            &self.policy,
            |current, target| {
                if let Some(existing) = current {
                    if keys.object_type_of(&existing.metadata.labels) == ObjectType::Replicated {
                        return false;
                    }
                }
                adapter.replicate(source, target);
                target.metadata.labels = keys.replica_labels(&source.metadata.labels);
                target.metadata.annotations =
                    keys.replica_annotations(&source.metadata.annotations, &source.metadata.namespace);
                if !target.metadata.has_finalizer(finalizer) {
                    target.metadata.finalizers.push(finalizer.to_string());
                }
                true
            },
        )
        .await?;

        match result {
            OperationResult::Created => {
                crate::metrics::record_replica_write(kind, "created");
                self.events.record(ReplicationEvent::normal(
                    events::REASON_CREATED,
                    kind,
                    &key,
                    format!("Created replica of {}", source.key()),
                ));
            }
            OperationResult::Updated => {
                crate::metrics::record_replica_write(kind, "updated");
                self.events.record(ReplicationEvent::normal(
                    events::REASON_UPDATED,
                    kind,
                    &key,
                    format!("Updated replica of {}", source.key()),
                ));
            }
            OperationResult::Skipped => {
                warn!(%kind, target = %key, source = %source.key(), "Target is itself a source, not overwriting");
                crate::metrics::record_replica_skipped(kind);
                self.events.record(ReplicationEvent::warning(
                    events::REASON_SKIPPED,
                    kind,
                    &key,
                    format!("Not replacing source object with replica of {}", source.key()),
                ));
            }
            OperationResult::Unchanged => {
                debug!(%kind, target = %key, "Replica up to date");
            }
        }
        Ok(result)
    }

    /// Take a replica out of service.
    ///
    /// A live replica is deleted (its finalizer turns that into a deletion
    /// mark); one that is already deleting has its finalizer dropped.
    async fn retire(&self, kind: &str, replica: &Object) -> Result<RetireMode> {
        let key = replica.key();

        if replica.is_deleting() {
            let released = self.finalizers.remove(self.store.as_ref(), kind, &key).await?;
            if !released {
                return Ok(RetireMode::AlreadyGone);
            }
            crate::metrics::record_replica_write(kind, "released");
            debug!(%kind, %key, "Released replica finalizer");
            return Ok(RetireMode::FinalizerReleased);
        }

        if !store::delete_if_exists(self.store.as_ref(), kind, &key).await? {
            return Ok(RetireMode::AlreadyGone);
        }
        crate::metrics::record_replica_write(kind, "deleted");
        self.events.record(ReplicationEvent::normal(
            events::REASON_DELETED,
            kind,
            &key,
            "Deleted replica",
        ));
        Ok(RetireMode::Deleted)
    }

    fn partial(&self, operation: &str, kind: &str, key: &ObjectKey, failures: Vec<NamespaceFailure>) -> ReplicatorError {
        let err = ReplicatorError::Partial {
            operation: operation.to_string(),
            failures,
        };
        self.events.record(ReplicationEvent::warning(
            events::REASON_FAILED,
            kind,
            key,
            err.to_string(),
        ));
        err
    }
}
