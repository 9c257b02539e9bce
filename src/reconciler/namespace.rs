//! Namespace-driven resync.
//!
//! When a namespace appears, changes labels or goes away, every kind is
//! re-evaluated for that one namespace:
//!
//! - gone or terminating: drop the finalizer of every replica in it
//! - ineligible: retire every replica in it
//! - eligible: write the replica of every live source elsewhere

use futures::future::join_all;
use tracing::{debug, info};

use super::{Action, FanOutStats, Reconciler};
use crate::adapter::KindAdapter;
use crate::error::{NamespaceFailure, ReplicatorError, Result};
use crate::keys::{REPLICA, REPLICATED};
use crate::object::{LabelSelector, Namespace, Object};
use crate::store::ObjectStore;

impl<S: ObjectStore + ?Sized> Reconciler<S> {
    pub(super) async fn reconcile_namespace(&self, name: &str) -> Result<Action> {
        let namespace = self.store.get_namespace(name).await?;

        let mut stats = FanOutStats::default();
        let mut failures = Vec::new();

        for kind in self.adapters.kinds() {
            let adapter = self.adapters.get(&kind)?;
            let adapter = adapter.as_ref();

            let (kind_stats, kind_failures) = match &namespace {
                Some(ns) if !ns.is_terminating() && self.filter.is_eligible(ns) => {
                    self.fill_namespace(adapter, ns).await?
                }
                Some(ns) if !ns.is_terminating() => self.drain_namespace(adapter, name).await?,
                _ => self.release_namespace(adapter, name).await?,
            };
            stats.merge(&kind_stats);
            failures.extend(kind_failures);
        }

        let outcome = if failures.is_empty() { "synced" } else { "partial" };
        crate::metrics::record_namespace_resync(outcome);

        if !failures.is_empty() {
            return Err(ReplicatorError::Partial {
                operation: format!("namespace resync of {}", name),
                failures,
            });
        }

        if stats.writes() > 0 {
            info!(namespace = %name, created = stats.created, updated = stats.updated,
                deleted = stats.deleted, released = stats.released, "Namespace resynced");
        } else {
            debug!(namespace = %name, "Namespace already in sync");
        }
        Ok(Action::NamespaceSynced(stats))
    }

    /// Eligible namespace: propagate every live source from elsewhere.
    async fn fill_namespace(
        &self,
        adapter: &dyn KindAdapter,
        namespace: &Namespace,
    ) -> Result<(FanOutStats, Vec<NamespaceFailure>)> {
        let kind = adapter.kind();
        let selector = LabelSelector::equals(self.keys.object_type(), REPLICATED);
        let sources: Vec<Object> = adapter
            .list_to_array(self.store.list(kind, &selector, None).await?)
            .into_iter()
            .filter(|s| s.metadata.namespace != namespace.name && self.is_live_source(s))
            .collect();

        let targets = std::slice::from_ref(namespace);
        let writes = sources.iter().map(|source| async move {
            // A replica must never exist without the source's finalizer.
            match self.finalizers.add(self.store.as_ref(), kind, &source.key()).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => return (FanOutStats::default(), Vec::new()),
                Err(e) => {
                    let failure = NamespaceFailure {
                        namespace: namespace.name.clone(),
                        message: format!("{} {}: {}", kind, source.key(), e),
                    };
                    return (FanOutStats::default(), vec![failure]);
                }
            }
            let (stats, failures) = self.propagate_to(adapter, source, targets).await;
            let failures = failures
                .into_iter()
                .map(|f| NamespaceFailure {
                    namespace: f.namespace,
                    message: format!("{} {}: {}", kind, source.key(), f.message),
                })
                .collect::<Vec<_>>();
            (stats, failures)
        });

        let mut stats = FanOutStats::default();
        let mut failures = Vec::new();
        for (s, f) in join_all(writes).await {
            stats.merge(&s);
            failures.extend(f);
        }
        Ok((stats, failures))
    }

    /// Ineligible namespace: retire every replica in it.
    async fn drain_namespace(
        &self,
        adapter: &dyn KindAdapter,
        namespace: &str,
    ) -> Result<(FanOutStats, Vec<NamespaceFailure>)> {
        let kind = adapter.kind();
        let replicas = self.replicas_in(adapter, namespace).await?;

        let removals = replicas.iter().map(|replica| self.retire(kind, replica));

        let mut stats = FanOutStats::default();
        let mut failures = Vec::new();
        for (replica, result) in replicas.iter().zip(join_all(removals).await) {
            match result {
                Ok(mode) => stats.record_retire(mode),
                Err(e) => failures.push(NamespaceFailure {
                    namespace: namespace.to_string(),
                    message: format!("{} {}: {}", kind, replica.key(), e),
                }),
            }
        }
        Ok((stats, failures))
    }

    /// Namespace gone or terminating: drop every replica finalizer in it.
    async fn release_namespace(
        &self,
        adapter: &dyn KindAdapter,
        namespace: &str,
    ) -> Result<(FanOutStats, Vec<NamespaceFailure>)> {
        let kind = adapter.kind();
        let replicas = self.replicas_in(adapter, namespace).await?;

        let releases = replicas
            .iter()
            .map(|replica| async move { self.finalizers.remove(self.store.as_ref(), kind, &replica.key()).await });

        let mut stats = FanOutStats::default();
        let mut failures = Vec::new();
        for (replica, result) in replicas.iter().zip(join_all(releases).await) {
            match result {
                Ok(true) => {
                    crate::metrics::record_replica_write(kind, "released");
                    stats.released += 1;
                }
                Ok(false) => {}
                Err(e) => failures.push(NamespaceFailure {
                    namespace: namespace.to_string(),
                    message: format!("{} {}: {}", kind, replica.key(), e),
                }),
            }
        }
        Ok((stats, failures))
    }

    async fn replicas_in(&self, adapter: &dyn KindAdapter, namespace: &str) -> Result<Vec<Object>> {
        let selector = LabelSelector::equals(self.keys.object_type(), REPLICA);
        let listed = self.store.list(adapter.kind(), &selector, Some(namespace)).await?;
        Ok(adapter.list_to_array(listed))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::*;
    use super::super::Action;
    use crate::error::ReplicatorError;
    use crate::object::{Object, ObjectKey};
    use crate::queue::QueueKey;
    use crate::store::ObjectStore;
    use serde_json::json;

    async fn sync(f: &Fixture, namespace: &str) -> Action {
        f.reconciler
            .reconcile(&QueueKey::namespace(namespace))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_new_namespace_receives_replicas() {
        let f = fixture(&["ns-a", "ns-b"]).await;
        f.store.create(secret("ns-a", "S")).await.unwrap();
        f.reconcile_secret("ns-a", "S").await;

        f.store.create_namespace("ns-new").await;
        let Action::NamespaceSynced(stats) = sync(&f, "ns-new").await else {
            panic!("expected namespace sync");
        };
        assert_eq!(stats.created, 1);

        let replica = f.get("ns-new", "S").await.unwrap();
        assert_eq!(replica.annotation(SOURCE_NS), Some("ns-a"));
        assert_eq!(replica.body.get("data"), Some(&json!({"k": "dg=="})));
    }

    #[tokio::test]
    async fn test_sync_matches_object_path() {
        // Same end state whichever entry point creates the replica.
        let by_object = fixture(&["ns-a", "ns-b"]).await;
        by_object.store.create(secret("ns-a", "S")).await.unwrap();
        by_object.reconcile_secret("ns-a", "S").await;

        let by_namespace = fixture(&["ns-a", "ns-b"]).await;
        by_namespace.store.create(secret("ns-a", "S")).await.unwrap();
        sync(&by_namespace, "ns-b").await;

        let a = by_object.get("ns-b", "S").await.unwrap();
        let b = by_namespace.get("ns-b", "S").await.unwrap();
        assert!(a.same_content(&b));

        // The namespace path also put the finalizer on the source.
        let source = by_namespace.get("ns-a", "S").await.unwrap();
        assert!(source.metadata.has_finalizer(FINALIZER));
    }

    #[tokio::test]
    async fn test_system_namespace_gets_nothing() {
        let f = fixture(&["ns-a", "kube-system"]).await;
        f.store.create(secret("ns-a", "S")).await.unwrap();

        let Action::NamespaceSynced(stats) = sync(&f, "kube-system").await else {
            panic!("expected namespace sync");
        };
        assert_eq!(stats.writes(), 0);
        assert!(f.get("kube-system", "S").await.is_none());
    }

    #[tokio::test]
    async fn test_managed_label_opts_system_namespace_in() {
        let f = fixture(&["ns-a", "kube-extra"]).await;
        f.store.create(secret("ns-a", "S")).await.unwrap();
        f.store
            .label_namespace("kube-extra", "replicator.io/namespace-type", "managed")
            .await
            .unwrap();

        sync(&f, "kube-extra").await;
        assert!(f.get("kube-extra", "S").await.is_some());
    }

    #[tokio::test]
    async fn test_ignored_label_drains_replicas() {
        let f = fixture(&["ns-a", "ns-b"]).await;
        f.store.create(secret("ns-a", "S")).await.unwrap();
        f.store
            .create(secret("ns-a", "T").with_field("data", json!({"t": "dA=="})))
            .await
            .unwrap();
        f.reconcile_secret("ns-a", "S").await;
        f.reconcile_secret("ns-a", "T").await;

        f.store
            .label_namespace("ns-b", "replicator.io/namespace-type", "ignored")
            .await
            .unwrap();
        let Action::NamespaceSynced(stats) = sync(&f, "ns-b").await else {
            panic!("expected namespace sync");
        };
        assert_eq!(stats.deleted, 2);

        // Second pass finishes the deletions.
        let Action::NamespaceSynced(stats) = sync(&f, "ns-b").await else {
            panic!("expected namespace sync");
        };
        assert_eq!(stats.released, 2);
        assert!(f.get("ns-b", "S").await.is_none());
        assert!(f.get("ns-b", "T").await.is_none());

        // Sources untouched.
        assert!(f.get("ns-a", "S").await.is_some());
    }

    #[tokio::test]
    async fn test_terminating_namespace_releases_finalizers() {
        let f = fixture(&["ns-a", "ns-b"]).await;
        f.store.create(secret("ns-a", "S")).await.unwrap();
        f.reconcile_secret("ns-a", "S").await;

        f.store.delete_namespace("ns-b").await.unwrap();
        assert!(f.store.get_namespace("ns-b").await.unwrap().is_some());

        let Action::NamespaceSynced(stats) = sync(&f, "ns-b").await else {
            panic!("expected namespace sync");
        };
        assert_eq!(stats.released, 1);
        assert!(f.store.get_namespace("ns-b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_namespace_is_quiet() {
        let f = fixture(&["ns-a"]).await;
        let Action::NamespaceSynced(stats) = sync(&f, "never-existed").await else {
            panic!("expected namespace sync");
        };
        assert_eq!(stats, Default::default());
    }

    #[tokio::test]
    async fn test_user_objects_in_ineligible_namespace_untouched() {
        let f = fixture(&["kube-system"]).await;
        f.store
            .create(Object::named("Secret", "kube-system", "token"))
            .await
            .unwrap();

        sync(&f, "kube-system").await;
        assert!(f.get("kube-system", "token").await.is_some());
    }

    #[tokio::test]
    async fn test_failures_aggregate() {
        let f = fixture(&["ns-a", "ns-b"]).await;
        f.store.create(secret("ns-a", "S")).await.unwrap();
        f.store.fail_namespace("ns-b").await;

        let err = f
            .reconciler
            .reconcile(&QueueKey::namespace("ns-b"))
            .await
            .unwrap_err();
        match err {
            ReplicatorError::Partial { failures, .. } => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].message.contains("ns-a/S"));
            }
            other => panic!("expected partial failure, got {:?}", other),
        }
        assert!(f
            .store
            .get("Secret", &ObjectKey::new("ns-b", "S"))
            .await
            .unwrap()
            .is_none());
    }
}
