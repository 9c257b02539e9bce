// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the engine keeps converging through write conflicts,
//! partial namespace failures, store outages and restarts, without panics
//! or deadlocks.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::*;
use namespace_replicator::events::REASON_FAILED;
use namespace_replicator::{EngineState, Object, ObjectKey, ObjectStore, ReplicatorConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

// =============================================================================
// Write Conflicts
// =============================================================================

/// Test: conflicts within the retry budget never surface
#[tokio::test]
async fn conflicts_within_budget_absorbed() {
    let h = Harness::start(&["ns-a", "ns-b"]).await;
    h.store.create(source_secret("ns-a", "S")).await.unwrap();
    h.store
        .inject_conflicts("Secret", &ObjectKey::new("ns-a", "S"), 3)
        .await;

    h.wait_present("Secret", "ns-b", "S").await;
    let source = h.wait_for("Secret", "ns-a", "S", |s| s.metadata.has_finalizer(FINALIZER)).await;
    assert_eq!(source.label(MARKER), Some("replicated"));
    h.stop().await;
}

/// Test: a conflict storm longer than the retry budget is requeued until it passes
#[tokio::test]
async fn conflict_storm_requeued_until_clear() {
    let h = Harness::start(&["ns-a", "ns-b"]).await;
    h.store.create(source_secret("ns-a", "S")).await.unwrap();
    h.store
        .inject_conflicts("Secret", &ObjectKey::new("ns-a", "S"), 40)
        .await;

    h.wait_present("Secret", "ns-b", "S").await;
    h.stop().await;
}

/// Test: conflicts on replica writes are retried against fresh state
#[tokio::test]
async fn replica_write_conflicts_absorbed() {
    let h = Harness::start(&["ns-a", "ns-b", "ns-c"]).await;
    h.store
        .inject_conflicts("Secret", &ObjectKey::new("ns-b", "S"), 4)
        .await;
    h.store.create(source_secret("ns-a", "S")).await.unwrap();

    h.wait_present("Secret", "ns-b", "S").await;
    h.wait_present("Secret", "ns-c", "S").await;
    h.stop().await;
}

// =============================================================================
// Partial Failures
// =============================================================================

/// Test: one failing namespace does not hold back the others, and catches up once healed
#[tokio::test]
async fn failing_namespace_heals() {
    let store = Arc::new(namespace_replicator::MemoryStore::new());
    for ns in ["ns-a", "ns-b", "ns-c"] {
        store.create_namespace(ns).await;
    }
    store.fail_namespace("ns-c").await;
    let h = Harness::start_on(store, ReplicatorConfig::for_testing()).await;

    h.store.create(source_secret("ns-a", "S")).await.unwrap();
    h.wait_present("Secret", "ns-b", "S").await;

    eventually("failure event", CONVERGE, || {
        let events = h.events.clone();
        async move { !events.with_reason(REASON_FAILED).is_empty() }
    })
    .await;
    assert!(h.secret("ns-c", "S").await.is_none());

    h.store.heal_namespace("ns-c").await;
    h.wait_present("Secret", "ns-c", "S").await;
    h.stop().await;
}

/// Test: a failing namespace keeps the source's finalizer until cleanup can finish
#[tokio::test]
async fn cleanup_blocked_by_failing_namespace() {
    let h = Harness::start(&["ns-a", "ns-b", "ns-c"]).await;
    h.store.create(source_secret("ns-a", "S")).await.unwrap();
    h.wait_present("Secret", "ns-b", "S").await;
    h.wait_present("Secret", "ns-c", "S").await;
    h.settle().await;

    h.store.fail_namespace("ns-c").await;
    h.store
        .delete("Secret", &ObjectKey::new("ns-a", "S"))
        .await
        .unwrap();

    h.wait_gone("Secret", "ns-b", "S").await;
    sleep(Duration::from_millis(100)).await;

    // Still held: its replica in ns-c could not be removed.
    let source = h.secret("ns-a", "S").await.expect("source held by finalizer");
    assert!(source.is_deleting());
    assert!(h.secret("ns-c", "S").await.is_some());

    h.store.heal_namespace("ns-c").await;
    h.wait_gone("Secret", "ns-c", "S").await;
    h.wait_gone("Secret", "ns-a", "S").await;
    h.stop().await;
}

/// Test: a malformed replica is reported but never blocks other work
#[tokio::test]
async fn malformed_replica_isolated() {
    let h = Harness::start(&["ns-a", "ns-b", "ns-c"]).await;
    let mut malformed = Object::named("Secret", "ns-b", "broken").with_label(MARKER, "replica");
    malformed.metadata.finalizers.push(FINALIZER.to_string());
    h.store.create(malformed).await.unwrap();

    h.store.create(source_secret("ns-a", "S")).await.unwrap();
    h.wait_present("Secret", "ns-b", "S").await;
    h.wait_present("Secret", "ns-c", "S").await;

    // Left for a human.
    let broken = h.secret("ns-b", "broken").await.unwrap();
    assert!(!broken.is_deleting());
    h.stop().await;
}

// =============================================================================
// Store Outages
// =============================================================================

/// Test: an engine started during an outage catches up once the store is back
#[tokio::test]
async fn outage_at_startup() {
    let store = Arc::new(namespace_replicator::MemoryStore::new());
    for ns in ["ns-a", "ns-b"] {
        store.create_namespace(ns).await;
    }
    store.create(source_secret("ns-a", "S")).await.unwrap();
    store.set_unavailable(true).await;

    let h = Harness::start_on(store, ReplicatorConfig::for_testing()).await;
    sleep(Duration::from_millis(100)).await;
    assert!(h.engine.is_running());

    h.store.set_unavailable(false).await;
    h.wait_present("Secret", "ns-b", "S").await;
    h.stop().await;
}

/// Test: work interrupted by an outage is retried to completion
#[tokio::test]
async fn outage_during_cleanup() {
    let h = Harness::start(&["ns-a", "ns-b", "ns-c"]).await;
    h.store.create(source_secret("ns-a", "S")).await.unwrap();
    h.wait_present("Secret", "ns-b", "S").await;
    h.wait_present("Secret", "ns-c", "S").await;
    h.settle().await;

    h.store
        .delete("Secret", &ObjectKey::new("ns-a", "S"))
        .await
        .unwrap();
    h.store.set_unavailable(true).await;
    sleep(Duration::from_millis(100)).await;
    h.store.set_unavailable(false).await;

    for ns in ["ns-a", "ns-b", "ns-c"] {
        h.wait_gone("Secret", ns, "S").await;
    }
    h.stop().await;
}

// =============================================================================
// Restarts & Shutdown
// =============================================================================

/// Test: changes made while no engine runs are picked up by the next one
#[tokio::test]
async fn restart_catches_up() {
    let h = Harness::start(&["ns-a", "ns-b"]).await;
    h.store.create(source_secret("ns-a", "S")).await.unwrap();
    h.wait_present("Secret", "ns-b", "S").await;
    h.settle().await;
    let store = h.stop().await;

    // Offline: source deleted (held by its finalizer), new source, new namespace.
    store.delete("Secret", &ObjectKey::new("ns-a", "S")).await.unwrap();
    store.create(source_secret("ns-b", "T")).await.unwrap();
    store.create_namespace("ns-c").await;

    let h = Harness::start_on(store, ReplicatorConfig::for_testing()).await;
    h.wait_gone("Secret", "ns-a", "S").await;
    h.wait_gone("Secret", "ns-b", "S").await;
    h.wait_present("Secret", "ns-a", "T").await;
    h.wait_present("Secret", "ns-c", "T").await;
    h.stop().await;
}

/// Test: shutdown under load completes and leaves a consistent store
#[tokio::test]
async fn shutdown_under_load() {
    let h = Harness::start(&["ns-a", "ns-b", "ns-c", "ns-d"]).await;
    for i in 0..50 {
        h.store
            .create(source_secret("ns-a", &format!("s-{}", i)))
            .await
            .unwrap();
    }

    let mut engine = h.engine;
    let result = tokio::time::timeout(Duration::from_secs(5), engine.shutdown()).await;
    assert!(result.is_ok(), "shutdown hung");
    assert_eq!(engine.state(), EngineState::Stopped);

    // A fresh engine finishes the job.
    let h = Harness::start_on(h.store, ReplicatorConfig::for_testing()).await;
    for i in 0..50 {
        h.wait_present("Secret", "ns-d", &format!("s-{}", i)).await;
    }
    h.stop().await;
}

/// Test: many sources and namespaces churning at once still converge
#[tokio::test]
async fn concurrent_churn_converges() {
    let h = Harness::start(&["ns-a", "ns-b"]).await;

    let creates = (0..10).map(|i| {
        let store = h.store.clone();
        async move { store.create(source_secret("ns-a", &format!("s-{}", i))).await }
    });
    let namespaces = (0..5).map(|i| {
        let store = h.store.clone();
        async move { store.create_namespace(&format!("extra-{}", i)).await }
    });
    let (created, _) = tokio::join!(futures::future::join_all(creates), futures::future::join_all(namespaces));
    assert!(created.iter().all(|r| r.is_ok()));

    for i in 0..10 {
        let name = format!("s-{}", i);
        h.wait_present("Secret", "ns-b", &name).await;
        for n in 0..5 {
            h.wait_present("Secret", &format!("extra-{}", n), &name).await;
        }
    }

    h.settle().await;
    let replicas = h
        .store
        .objects_of("Secret")
        .await
        .into_iter()
        .filter(|o| o.label(MARKER) == Some("replica"))
        .count();
    assert_eq!(replicas, 10 * 6);
    h.stop().await;
}
