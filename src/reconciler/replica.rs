//! Replica validation.
//!
//! A replica is legitimate only while its namespace accepts replicas and
//! its source (same name, namespace from the back-pointer annotation) is a
//! live, marked source. Anything else makes it an orphan.

use tracing::{debug, info};

use super::{Action, Reconciler, RetireMode};
use crate::adapter::KindAdapter;
use crate::error::{ReplicatorError, Result};
use crate::events::{self, ReplicationEvent};
use crate::object::Object;
use crate::queue::QueueKey;
use crate::store::ObjectStore;

impl<S: ObjectStore + ?Sized> Reconciler<S> {
    pub(super) async fn validate_replica(&self, adapter: &dyn KindAdapter, replica: &Object) -> Result<Action> {
        let kind = adapter.kind();
        let key = replica.key();

        // Namespace going away: never block it.
        let namespace = self.store.get_namespace(&key.namespace).await?;
        let namespace = match namespace {
            Some(ns) if !ns.is_terminating() => ns,
            _ => {
                let released = self.finalizers.remove(self.store.as_ref(), kind, &key).await?;
                let mode = if released {
                    crate::metrics::record_replica_write(kind, "released");
                    RetireMode::FinalizerReleased
                } else {
                    RetireMode::AlreadyGone
                };
                debug!(%kind, %key, "Replica namespace terminating, finalizer released");
                return Ok(Action::ReplicaRetired { mode, follow_up: None });
            }
        };

        let Some(source_namespace) = replica.annotation(self.keys.source_namespace()) else {
            let err = ReplicatorError::MalformedReplica {
                kind: kind.to_string(),
                key: key.to_string(),
                annotation: self.keys.source_namespace().to_string(),
            };
            self.events.record(ReplicationEvent::warning(
                events::REASON_FAILED,
                kind,
                &key,
                err.to_string(),
            ));
            return Err(err);
        };

        if !self.filter.is_eligible(&namespace) {
            let mode = self.retire(kind, replica).await?;
            info!(%kind, %key, ?mode, "Retired replica in ineligible namespace");
            return Ok(Action::ReplicaRetired { mode, follow_up: None });
        }

        let source_key = key.in_namespace(source_namespace);
        let source = self.store.get(kind, &source_key).await?;
        let source_valid = source_key != key && source.as_ref().map(|s| self.is_live_source(s)).unwrap_or(false);

        if !source_valid {
            let mode = self.retire(kind, replica).await?;
            info!(%kind, %key, source = %source_key, ?mode, "Retired orphaned replica");
            return Ok(Action::ReplicaRetired { mode, follow_up: None });
        }

        if replica.is_deleting() {
            // Deleted out from under a live source: let it go, then have the
            // source recreate it.
            self.finalizers.remove(self.store.as_ref(), kind, &key).await?;
            crate::metrics::record_replica_write(kind, "released");
            info!(%kind, %key, source = %source_key, "Replica deleted while source is live, recreating");
            return Ok(Action::ReplicaRetired {
                mode: RetireMode::FinalizerReleased,
                follow_up: Some(QueueKey::object(kind, source_key)),
            });
        }

        // Content is refreshed by the source's reconcile.
        debug!(%kind, %key, "Replica valid");
        Ok(Action::NoOp)
    }
}
