//! Source propagation and source-removal cleanup.

use futures::future::join_all;
use tracing::{debug, info};

use super::{Action, FanOutStats, Reconciler};
use crate::adapter::KindAdapter;
use crate::error::{NamespaceFailure, ReplicatorError, Result};
use crate::keys::ObjectType;
use crate::object::{LabelSelector, Object};
use crate::store::ObjectStore;

impl<S: ObjectStore + ?Sized> Reconciler<S> {
    /// Mirror a live source into every eligible namespace.
    pub(super) async fn propagate_source(&self, adapter: &dyn KindAdapter, source: &Object) -> Result<Action> {
        let kind = adapter.kind();
        let key = source.key();

        let marker = self.keys.object_type_of(&source.metadata.labels);
        if marker != ObjectType::Replicated {
            return Err(ReplicatorError::UnexpectedMarker {
                kind: kind.to_string(),
                key: key.to_string(),
                expected: ObjectType::Replicated.to_string(),
                actual: marker.to_string(),
            });
        }

        // The finalizer goes on before any replica exists.
        match self.finalizers.add(self.store.as_ref(), kind, &key).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                debug!(%kind, %key, "Source vanished before propagation");
                return Ok(Action::NoOp);
            }
            Err(e) => return Err(e),
        }

        let namespaces = self.store.list_namespaces().await?;
        let (stats, failures) = self.propagate_to(adapter, source, &namespaces).await;

        if !failures.is_empty() {
            return Err(self.partial("propagate", kind, &key, failures));
        }
        if stats.created + stats.updated > 0 {
            info!(%kind, %key, created = stats.created, updated = stats.updated, "Propagated source");
        } else {
            debug!(%kind, %key, unchanged = stats.unchanged, "Source already propagated");
        }
        Ok(Action::Propagated(stats))
    }

    /// Delete every replica of a source that is going away (deleted,
    /// unmarked, or re-marked), then drop the source's finalizer.
    ///
    /// The finalizer stays if any replica could not be deleted.
    pub(super) async fn cleanup_source(&self, adapter: &dyn KindAdapter, source: &Object) -> Result<Action> {
        let kind = adapter.kind();
        let key = source.key();
        let source_namespace = source.metadata.namespace.as_str();

        let selector = LabelSelector::equals(self.keys.object_type(), crate::keys::REPLICA);
        let listed = self.store.list(kind, &selector, None).await?;
        let replicas: Vec<Object> = adapter
            .list_to_array(listed)
            .into_iter()
            .filter(|r| {
                r.metadata.name == source.metadata.name
                    && r.metadata.namespace != source_namespace
                    && r.annotation(self.keys.source_namespace()) == Some(source_namespace)
            })
            .collect();

        let removals = replicas.iter().map(|replica| async move {
            let result = self.retire(kind, replica).await;
            (replica.metadata.namespace.as_str(), result)
        });

        let mut stats = FanOutStats::default();
        let mut failures = Vec::new();
        for (namespace, result) in join_all(removals).await {
            match result {
                Ok(mode) => stats.record_retire(mode),
                Err(e) => failures.push(NamespaceFailure {
                    namespace: namespace.to_string(),
                    message: e.to_string(),
                }),
            }
        }

        if !failures.is_empty() {
            return Err(self.partial("cleanup", kind, &key, failures));
        }

        self.finalizers.remove(self.store.as_ref(), kind, &key).await?;
        info!(%kind, %key, deleted = stats.deleted, released = stats.released, "Cleaned up source");
        Ok(Action::CleanedUp(stats))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::*;
    use super::super::{Action, RetireMode};
    use crate::error::ReplicatorError;
    use crate::events::{REASON_CREATED, REASON_FAILED, REASON_SKIPPED, REASON_UPDATED};
    use crate::keys::strip_owned_keys;
    use crate::object::{Object, ObjectKey};
    use crate::store::ObjectStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_concrete_scenario_propagation() {
        let f = fixture(&["ns-a", "ns-b", "ns-c", "kube-system", "replicator-system"]).await;
        f.store.create(secret("ns-a", "S")).await.unwrap();

        let Action::Propagated(stats) = f.reconcile_secret("ns-a", "S").await else {
            panic!("expected propagation");
        };
        assert_eq!(stats.created, 2);

        for ns in ["ns-b", "ns-c"] {
            let replica = f.get(ns, "S").await.expect("replica exists");
            assert_eq!(replica.label(MARKER), Some("replica"));
            assert_eq!(replica.annotation(SOURCE_NS), Some("ns-a"));
            assert_eq!(replica.label("team"), Some("x"));
            assert_eq!(replica.annotation("note"), Some("hello"));
            assert_eq!(replica.body.get("data"), Some(&json!({"k": "dg=="})));
            assert!(replica.metadata.has_finalizer(FINALIZER));
        }
        assert!(f.get("kube-system", "S").await.is_none());
        assert!(f.get("replicator-system", "S").await.is_none());

        let source = f.get("ns-a", "S").await.unwrap();
        assert!(source.metadata.has_finalizer(FINALIZER));
        assert_eq!(f.events.with_reason(REASON_CREATED).len(), 2);
    }

    #[tokio::test]
    async fn test_copy_set_matches_source() {
        let f = fixture(&["ns-a", "ns-b"]).await;
        let source = secret("ns-a", "S")
            .with_label("replicator.io/extra", "dropped")
            .with_annotation("replicator.io/other", "dropped");
        f.store.create(source).await.unwrap();
        f.reconcile_secret("ns-a", "S").await;

        let source = f.get("ns-a", "S").await.unwrap();
        let replica = f.get("ns-b", "S").await.unwrap();
        assert_eq!(
            strip_owned_keys(&replica.metadata.labels, "replicator.io"),
            strip_owned_keys(&source.metadata.labels, "replicator.io")
        );
        assert_eq!(
            strip_owned_keys(&replica.metadata.annotations, "replicator.io"),
            strip_owned_keys(&source.metadata.annotations, "replicator.io")
        );
        assert_eq!(replica.label("replicator.io/extra"), None);
    }

    #[tokio::test]
    async fn test_second_reconcile_writes_nothing() {
        let f = fixture(&["ns-a", "ns-b", "ns-c"]).await;
        f.store.create(secret("ns-a", "S")).await.unwrap();
        f.reconcile_secret("ns-a", "S").await;

        f.store.reset_write_count();
        let Action::Propagated(stats) = f.reconcile_secret("ns-a", "S").await else {
            panic!("expected propagation");
        };
        assert_eq!(f.store.write_count(), 0);
        assert_eq!(stats.unchanged, 2);
        assert_eq!(stats.writes(), 0);
    }

    #[tokio::test]
    async fn test_source_change_updates_replicas() {
        let f = fixture(&["ns-a", "ns-b"]).await;
        f.store.create(secret("ns-a", "S")).await.unwrap();
        f.reconcile_secret("ns-a", "S").await;

        let mut source = f.get("ns-a", "S").await.unwrap();
        source.body.insert("data".into(), json!({"k": "bmV3"}));
        source.metadata.labels.remove("team");
        f.store.update(source).await.unwrap();

        let Action::Propagated(stats) = f.reconcile_secret("ns-a", "S").await else {
            panic!("expected propagation");
        };
        assert_eq!(stats.updated, 1);

        let replica = f.get("ns-b", "S").await.unwrap();
        assert_eq!(replica.body.get("data"), Some(&json!({"k": "bmV3"})));
        assert_eq!(replica.label("team"), None);
        assert_eq!(f.events.with_reason(REASON_UPDATED).len(), 1);
    }

    #[tokio::test]
    async fn test_drifted_replica_restored() {
        let f = fixture(&["ns-a", "ns-b"]).await;
        f.store.create(secret("ns-a", "S")).await.unwrap();
        f.reconcile_secret("ns-a", "S").await;

        let mut replica = f.get("ns-b", "S").await.unwrap();
        replica.body.insert("data".into(), json!({"tampered": "yes"}));
        f.store.update(replica).await.unwrap();

        f.reconcile_secret("ns-a", "S").await;
        let replica = f.get("ns-b", "S").await.unwrap();
        assert_eq!(replica.body.get("data"), Some(&json!({"k": "dg=="})));
    }

    #[tokio::test]
    async fn test_other_source_never_overwritten() {
        let f = fixture(&["ns-a", "ns-b"]).await;
        f.store.create(secret("ns-a", "S")).await.unwrap();
        let other = secret("ns-b", "S").with_field("data", json!({"mine": "1"}));
        f.store.create(other).await.unwrap();

        let Action::Propagated(stats) = f.reconcile_secret("ns-a", "S").await else {
            panic!("expected propagation");
        };
        assert_eq!(stats.skipped, 1);

        let untouched = f.get("ns-b", "S").await.unwrap();
        assert_eq!(untouched.label(MARKER), Some("replicated"));
        assert_eq!(untouched.body.get("data"), Some(&json!({"mine": "1"})));
        assert_eq!(f.events.with_reason(REASON_SKIPPED).len(), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_reports_namespaces() {
        let f = fixture(&["ns-a", "ns-b", "ns-c"]).await;
        f.store.create(secret("ns-a", "S")).await.unwrap();
        f.store.fail_namespace("ns-c").await;

        let err = f
            .reconciler
            .reconcile(&object_key("Secret", "ns-a", "S"))
            .await
            .unwrap_err();
        match &err {
            ReplicatorError::Partial { failures, .. } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].namespace, "ns-c");
            }
            other => panic!("expected partial failure, got {:?}", other),
        }
        assert!(err.is_retryable());
        // Healthy namespace still got its replica.
        assert!(f.get("ns-b", "S").await.is_some());
        assert_eq!(f.events.with_reason(REASON_FAILED).len(), 1);

        f.store.heal_namespace("ns-c").await;
        f.reconcile_secret("ns-a", "S").await;
        assert!(f.get("ns-c", "S").await.is_some());
    }

    #[tokio::test]
    async fn test_deleted_source_cleans_up() {
        let f = fixture(&["ns-a", "ns-b", "ns-c"]).await;
        f.store.create(secret("ns-a", "S")).await.unwrap();
        f.reconcile_secret("ns-a", "S").await;

        f.store
            .delete("Secret", &ObjectKey::new("ns-a", "S"))
            .await
            .unwrap();
        // Finalizer holds the source until cleanup.
        assert!(f.get("ns-a", "S").await.unwrap().is_deleting());

        let Action::CleanedUp(stats) = f.reconcile_secret("ns-a", "S").await else {
            panic!("expected cleanup");
        };
        assert_eq!(stats.deleted, 2);
        assert!(f.get("ns-a", "S").await.is_none());

        // Replicas are marked; their own reconcile drops the finalizer.
        for ns in ["ns-b", "ns-c"] {
            assert!(f.get(ns, "S").await.unwrap().is_deleting());
            let action = f.reconcile_secret(ns, "S").await;
            assert!(matches!(
                action,
                Action::ReplicaRetired {
                    mode: RetireMode::FinalizerReleased,
                    follow_up: None
                }
            ));
            assert!(f.get(ns, "S").await.is_none());
        }
    }

    #[tokio::test]
    async fn test_unmarking_cleans_up() {
        let f = fixture(&["ns-a", "ns-b"]).await;
        f.store.create(secret("ns-a", "S")).await.unwrap();
        f.reconcile_secret("ns-a", "S").await;

        let mut source = f.get("ns-a", "S").await.unwrap();
        source.metadata.labels.remove(MARKER);
        f.store.update(source).await.unwrap();

        assert!(matches!(f.reconcile_secret("ns-a", "S").await, Action::CleanedUp(_)));
        let source = f.get("ns-a", "S").await.unwrap();
        assert!(!source.metadata.has_finalizer(FINALIZER));
        assert!(f.get("ns-b", "S").await.unwrap().is_deleting());
        f.reconcile_secret("ns-b", "S").await;
        assert!(f.get("ns-b", "S").await.is_none());

        // Nothing further happens to the unmarked object.
        assert_eq!(f.reconcile_secret("ns-a", "S").await, Action::NoOp);
    }

    #[tokio::test]
    async fn test_unknown_marker_cleans_up() {
        let f = fixture(&["ns-a", "ns-b"]).await;
        f.store.create(secret("ns-a", "S")).await.unwrap();
        f.reconcile_secret("ns-a", "S").await;

        let mut source = f.get("ns-a", "S").await.unwrap();
        source.metadata.labels.insert(MARKER.into(), "mirror".into());
        f.store.update(source).await.unwrap();

        assert!(matches!(f.reconcile_secret("ns-a", "S").await, Action::CleanedUp(_)));
        assert!(f.get("ns-b", "S").await.unwrap().is_deleting());
    }

    #[tokio::test]
    async fn test_cleanup_spares_other_sources_replicas() {
        let f = fixture(&["ns-a", "ns-b", "ns-c"]).await;
        f.store.create(secret("ns-a", "S")).await.unwrap();
        f.reconcile_secret("ns-a", "S").await;

        // A same-named replica belonging to a different source.
        let mut foreign = f.get("ns-c", "S").await.unwrap();
        foreign.metadata.annotations.insert(SOURCE_NS.into(), "ns-z".into());
        f.store.update(foreign).await.unwrap();

        f.store
            .delete("Secret", &ObjectKey::new("ns-a", "S"))
            .await
            .unwrap();
        let Action::CleanedUp(stats) = f.reconcile_secret("ns-a", "S").await else {
            panic!("expected cleanup");
        };
        assert_eq!(stats.deleted, 1);
        assert!(!f.get("ns-c", "S").await.unwrap().is_deleting());
    }

    #[tokio::test]
    async fn test_cleanup_failure_keeps_finalizer() {
        let f = fixture(&["ns-a", "ns-b", "ns-c"]).await;
        f.store.create(secret("ns-a", "S")).await.unwrap();
        f.reconcile_secret("ns-a", "S").await;
        f.store
            .delete("Secret", &ObjectKey::new("ns-a", "S"))
            .await
            .unwrap();
        f.store.fail_namespace("ns-c").await;

        let err = f
            .reconciler
            .reconcile(&object_key("Secret", "ns-a", "S"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicatorError::Partial { .. }));
        let source = f.get("ns-a", "S").await.unwrap();
        assert!(source.metadata.has_finalizer(FINALIZER));
        // ns-b deletion is not rolled back.
        assert!(f.get("ns-b", "S").await.unwrap().is_deleting());

        f.store.heal_namespace("ns-c").await;
        assert!(matches!(f.reconcile_secret("ns-a", "S").await, Action::CleanedUp(_)));
        assert!(f.get("ns-a", "S").await.is_none());
    }

    #[tokio::test]
    async fn test_propagate_rejects_non_source() {
        let f = fixture(&["ns-a"]).await;
        let adapter = f.reconciler.adapters().get("Secret").unwrap();
        let plain = Object::named("Secret", "ns-a", "p");

        let err = f
            .reconciler
            .propagate_source(adapter.as_ref(), &plain)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicatorError::UnexpectedMarker { .. }));
    }

    #[tokio::test]
    async fn test_finalizer_conflicts_are_absorbed() {
        let f = fixture(&["ns-a", "ns-b"]).await;
        f.store.create(secret("ns-a", "S")).await.unwrap();
        f.store
            .inject_conflicts("Secret", &ObjectKey::new("ns-a", "S"), 2)
            .await;

        assert!(matches!(f.reconcile_secret("ns-a", "S").await, Action::Propagated(_)));
        assert!(f.get("ns-b", "S").await.is_some());
    }
}
