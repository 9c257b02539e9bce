//! Finalizer manager.
//!
//! Adds or removes the engine's finalizer on one object through the
//! read → mutate → write cycle, so a concurrent writer never loses its
//! change and a conflict never leaves the object half-updated.

use tracing::debug;

use crate::error::{Result, StoreError};
use crate::object::{Object, ObjectKey};
use crate::resilience::{read_mutate_write, RetryConfig};
use crate::store::ObjectStore;

#[derive(Debug, Clone)]
pub struct FinalizerManager {
    finalizer: String,
    policy: RetryConfig,
}

impl FinalizerManager {
    pub fn new(finalizer: impl Into<String>, policy: RetryConfig) -> Self {
        Self {
            finalizer: finalizer.into(),
            policy,
        }
    }

    pub fn finalizer(&self) -> &str {
        &self.finalizer
    }

    /// Ensure the finalizer is present.
    ///
    /// Returns `true` if a write happened. A missing object is an error.
    pub async fn add<S>(&self, store: &S, kind: &str, key: &ObjectKey) -> Result<bool>
    where
        S: ObjectStore + ?Sized,
    {
        let finalizer = self.finalizer.as_str();
        let outcome = read_mutate_write(
            &self.policy,
            move || async move { fetch(store, kind, key).await },
            |obj: &mut Object| {
                if obj.metadata.has_finalizer(finalizer) {
                    return false;
                }
                obj.metadata.finalizers.push(finalizer.to_string());
                true
            },
            move |obj: Object| async move { store.update(obj).await },
        )
        .await?;

        let written = outcome.is_written();
        if written {
            debug!(%kind, %key, %finalizer, "Added finalizer");
            crate::metrics::record_finalizer_write("add");
        }
        Ok(written)
    }

    /// Ensure the finalizer is absent.
    ///
    /// Returns `true` if a write happened. A missing object counts as
    /// already done.
    pub async fn remove<S>(&self, store: &S, kind: &str, key: &ObjectKey) -> Result<bool>
    where
        S: ObjectStore + ?Sized,
    {
        let finalizer = self.finalizer.as_str();
        let result = read_mutate_write(
            &self.policy,
            move || async move { fetch(store, kind, key).await },
            |obj: &mut Object| {
                let before = obj.metadata.finalizers.len();
                obj.metadata.finalizers.retain(|f| f != finalizer);
                obj.metadata.finalizers.len() != before
            },
            move |obj: Object| async move { store.update(obj).await },
        )
        .await;

        match result {
            Ok(outcome) => {
                let written = outcome.is_written();
                if written {
                    debug!(%kind, %key, %finalizer, "Removed finalizer");
                    crate::metrics::record_finalizer_write("remove");
                }
                Ok(written)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

async fn fetch<S>(store: &S, kind: &str, key: &ObjectKey) -> std::result::Result<Object, StoreError>
where
    S: ObjectStore + ?Sized,
{
    match store.get(kind, key).await? {
        Some(obj) => Ok(obj),
        None => Err(StoreError::not_found(kind, key)),
    }
}
