//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - A running engine over an in-process store
//! - Object builders for marked sources
//! - `eventually` polling for convergence assertions

#![allow(dead_code)]

use namespace_replicator::{
    MemoryEventSink, MemoryStore, Object, ObjectKey, ObjectStore, ReplicationEngine, ReplicatorConfig,
};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const MARKER: &str = "replicator.io/object-type";
pub const SOURCE_NS: &str = "replicator.io/source-namespace";
pub const FINALIZER: &str = "replicator.io/finalizer";
pub const NAMESPACE_TYPE: &str = "replicator.io/namespace-type";

/// How long convergence may take before a test fails.
pub const CONVERGE: Duration = Duration::from_secs(5);

/// An engine running over a [`MemoryStore`].
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub events: Arc<MemoryEventSink>,
    pub engine: ReplicationEngine<MemoryStore>,
}

impl Harness {
    /// Create namespaces, then start an engine with the testing config.
    pub async fn start(namespaces: &[&str]) -> Self {
        Self::start_with(namespaces, ReplicatorConfig::for_testing()).await
    }

    pub async fn start_with(namespaces: &[&str], config: ReplicatorConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        for ns in namespaces {
            store.create_namespace(ns).await;
        }
        Self::start_on(store, config).await
    }

    /// Start an engine over an existing store.
    pub async fn start_on(store: Arc<MemoryStore>, config: ReplicatorConfig) -> Self {
        let events = Arc::new(MemoryEventSink::new());
        let mut engine = ReplicationEngine::new(store.clone(), config, events.clone()).expect("valid config");
        engine.start().await.expect("engine starts");
        Self { store, events, engine }
    }

    pub async fn get(&self, kind: &str, namespace: &str, name: &str) -> Option<Object> {
        self.store
            .get(kind, &ObjectKey::new(namespace, name))
            .await
            .expect("store get")
    }

    pub async fn secret(&self, namespace: &str, name: &str) -> Option<Object> {
        self.get("Secret", namespace, name).await
    }

    /// Wait until the object exists and satisfies `pred`.
    pub async fn wait_for<P>(&self, kind: &str, namespace: &str, name: &str, pred: P) -> Object
    where
        P: Fn(&Object) -> bool,
    {
        let deadline = Instant::now() + CONVERGE;
        loop {
            if let Some(obj) = self.get(kind, namespace, name).await {
                if pred(&obj) {
                    return obj;
                }
            }
            if Instant::now() >= deadline {
                panic!("timed out waiting for {} {}/{}", kind, namespace, name);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_present(&self, kind: &str, namespace: &str, name: &str) -> Object {
        self.wait_for(kind, namespace, name, |_| true).await
    }

    pub async fn wait_gone(&self, kind: &str, namespace: &str, name: &str) {
        let deadline = Instant::now() + CONVERGE;
        while self.get(kind, namespace, name).await.is_some() {
            if Instant::now() >= deadline {
                panic!("timed out waiting for {} {}/{} to go away", kind, namespace, name);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until the engine has nothing queued or in flight.
    pub async fn settle(&self) {
        assert!(self.engine.wait_idle(CONVERGE).await, "engine never went idle");
    }

    pub async fn stop(mut self) -> Arc<MemoryStore> {
        self.engine.shutdown().await;
        self.store
    }
}

/// Poll `check` every few milliseconds until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(what: &str, timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A source secret with one data entry.
pub fn source_secret(namespace: &str, name: &str) -> Object {
    Object::named("Secret", namespace, name)
        .with_label(MARKER, "replicated")
        .with_label("app", "web")
        .with_annotation("owner", "team-a")
        .with_field("type", json!("Opaque"))
        .with_field("data", json!({"k": "dg=="}))
}

/// A source config map.
pub fn source_config_map(namespace: &str, name: &str) -> Object {
    Object::named("ConfigMap", namespace, name)
        .with_label(MARKER, "replicated")
        .with_field("data", json!({"feature": "on"}))
}
