// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Object store integration traits.
//!
//! Defines what the engine needs from the cluster's object store: per-kind
//! CRUD with optimistic concurrency, namespace lookups, and a change signal.
//! [`MemoryStore`] is the in-process implementation.
//!
//! # Example
//!
//! ```rust,no_run
//! use namespace_replicator::store::{ObjectStore, MemoryStore, create_or_update, OperationResult};
//! use namespace_replicator::adapter::FieldCopyAdapter;
//! use namespace_replicator::object::ObjectKey;
//! use namespace_replicator::resilience::RetryConfig;
//! use serde_json::json;
//!
//! # async fn example() -> namespace_replicator::error::StoreResult<()> {
//! let store = MemoryStore::new();
//! store.create_namespace("team-a").await;
//!
//! let adapter = FieldCopyAdapter::config_map();
//! let key = ObjectKey::new("team-a", "settings");
//! let result = create_or_update(&store, &adapter, &key, &RetryConfig::conflict(), |_, obj| {
//!     obj.body.insert("data".into(), json!({"mode": "fast"}));
//!     true
//! })
//! .await?;
//! assert_eq!(result, OperationResult::Created);
//! # Ok(())
//! # }
//! ```

pub mod memory;

pub use memory::MemoryStore;

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use tokio::sync::broadcast;

use crate::adapter::KindAdapter;
use crate::error::{StoreError, StoreResult};
use crate::object::{LabelSelector, Namespace, Object, ObjectKey, ObjectList};
use crate::resilience::{read_mutate_write, RetryConfig, WriteOutcome};

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Change signal raised by the store.
///
/// Carries identity only; receivers always re-read current state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchEvent {
    Object { kind: String, key: ObjectKey },
    Namespace { name: String },
}

impl fmt::Display for WatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object { kind, key } => write!(f, "{} {}", kind, key),
            Self::Namespace { name } => write!(f, "Namespace {}", name),
        }
    }
}

/// Trait defining what the engine needs from the object store.
///
/// Contract:
/// - `get` / `get_namespace` report absence as `Ok(None)`
/// - `update` fails with [`StoreError::Conflict`] when the object's
///   `resource_version` no longer matches the stored one
/// - `create` fails with [`StoreError::AlreadyExists`] when the key is taken
/// - `delete` of an object that still carries finalizers only marks it
///   (`deletion_timestamp`); it disappears once the last finalizer is
///   removed by an `update`
/// - `delete` of a missing object fails with [`StoreError::NotFound`]
pub trait ObjectStore: Send + Sync + 'static {
    fn get<'a>(&'a self, kind: &'a str, key: &'a ObjectKey) -> BoxFuture<'a, Option<Object>>;

    /// List objects of `kind` matching `selector`, in one namespace or in all
    /// of them.
    fn list<'a>(
        &'a self,
        kind: &'a str,
        selector: &'a LabelSelector,
        namespace: Option<&'a str>,
    ) -> BoxFuture<'a, ObjectList>;

    fn create(&self, object: Object) -> BoxFuture<'_, Object>;

    fn update(&self, object: Object) -> BoxFuture<'_, Object>;

    fn delete<'a>(&'a self, kind: &'a str, key: &'a ObjectKey) -> BoxFuture<'a, ()>;

    fn get_namespace<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Option<Namespace>>;

    fn list_namespaces(&self) -> BoxFuture<'_, Vec<Namespace>>;

    /// Subscribe to change signals.
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}

/// What a [`create_or_update`] call ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    Created,
    Updated,
    /// The stored object already matched.
    Unchanged,
    /// The mutation declined to touch the existing object.
    Skipped,
}

impl OperationResult {
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Created | Self::Updated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::Skipped => "skipped",
        }
    }
}

struct Candidate {
    current: Option<Object>,
    object: Object,
    declined: bool,
}

/// Fetch-or-blank, mutate, then create or update.
///
/// `mutate` receives the currently stored object (if any) and the working
/// copy; returning `false` declines the write. A conflict or an
/// already-exists race restarts the whole cycle from a fresh read under
/// `policy`. No write happens when the mutated copy matches what is stored.
pub async fn create_or_update<S, F>(
    store: &S,
    adapter: &dyn KindAdapter,
    key: &ObjectKey,
    policy: &RetryConfig,
    mut mutate: F,
) -> StoreResult<OperationResult>
where
    S: ObjectStore + ?Sized,
    F: FnMut(Option<&Object>, &mut Object) -> bool,
{
    let outcome = read_mutate_write(
        policy,
        move || async move {
            let current = store.get(adapter.kind(), key).await?;
            let object = match &current {
                Some(existing) => existing.clone(),
                None => {
                    let mut blank = adapter.empty_object();
                    blank.metadata.namespace = key.namespace.clone();
                    blank.metadata.name = key.name.clone();
                    blank
                }
            };
            Ok(Candidate {
                current,
                object,
                declined: false,
            })
        },
        |candidate: &mut Candidate| {
            if !mutate(candidate.current.as_ref(), &mut candidate.object) {
                candidate.declined = true;
                return false;
            }
            match &candidate.current {
                Some(existing) => !existing.same_content(&candidate.object),
                None => true,
            }
        },
        move |candidate: Candidate| async move {
            match candidate.current {
                None => store.create(candidate.object).await.map(|_| OperationResult::Created),
                Some(_) => store.update(candidate.object).await.map(|_| OperationResult::Updated),
            }
        },
    )
    .await?;

    Ok(match outcome {
        WriteOutcome::Written(result) => result,
        WriteOutcome::Unchanged(candidate) if candidate.declined => OperationResult::Skipped,
        WriteOutcome::Unchanged(_) => OperationResult::Unchanged,
    })
}

/// Delete, treating an already-absent object as success.
///
/// Returns whether a delete request was issued against an existing object.
pub async fn delete_if_exists<S>(store: &S, kind: &str, key: &ObjectKey) -> StoreResult<bool>
where
    S: ObjectStore + ?Sized,
{
    match store.delete(kind, key).await {
        Ok(()) => Ok(true),
        Err(StoreError::NotFound { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}
