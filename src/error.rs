// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replicator.
//!
//! Errors are split in two layers:
//!
//! - [`StoreError`]: what the object store reports. `NotFound` and
//!   `Conflict` are distinguished because the reconciler treats them very
//!   differently from every other failure.
//! - [`ReplicatorError`]: what a reconcile (or the engine lifecycle) reports.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Store(NotFound)` | n/a | Object already absent; callers treat this as success |
//! | `Store(Conflict)` | Yes | Resource version moved between read and write |
//! | `Store(AlreadyExists)` | Yes | A concurrent writer created the object first |
//! | `Store(Unavailable)` | Yes | Transient store failure |
//! | `Partial` | Yes | Some namespaces of a fan-out failed |
//! | `MalformedReplica` | No | Replica lacks its source-namespace annotation |
//! | `UnexpectedMarker` | No | Source re-read carries an unknown marker |
//! | `UnknownKind` | No | No adapter registered for the kind |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Engine lifecycle misuse |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Every failed reconcile is requeued with backoff regardless of class; the
//! engine never stops serving other keys. [`ReplicatorError::is_retryable()`]
//! only drives log levels and metrics labels: a non-retryable error means a
//! human has to fix the object or the configuration before the retry can
//! succeed.

use thiserror::Error;

/// Result type alias for replicator operations.
pub type Result<T> = std::result::Result<T, ReplicatorError>;

/// Result type alias for object store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors reported by an [`ObjectStore`](crate::store::ObjectStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The object (or namespace) does not exist.
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: String },

    /// Optimistic concurrency failure: the object changed since it was read.
    #[error("conflict writing {kind} {key}: object has been modified")]
    Conflict { kind: String, key: String },

    /// Create raced another writer.
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: String },

    /// The store could not serve the request.
    #[error("store unavailable ({operation}): {message}")]
    Unavailable { operation: String, message: String },
}

impl StoreError {
    /// Build a not-found error.
    pub fn not_found(kind: impl Into<String>, key: impl ToString) -> Self {
        Self::NotFound {
            kind: kind.into(),
            key: key.to_string(),
        }
    }

    /// Build a conflict error.
    pub fn conflict(kind: impl Into<String>, key: impl ToString) -> Self {
        Self::Conflict {
            kind: kind.into(),
            key: key.to_string(),
        }
    }

    /// Build an unavailable error.
    pub fn unavailable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// One failed namespace inside a fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceFailure {
    pub namespace: String,
    pub message: String,
}

impl std::fmt::Display for NamespaceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.namespace, self.message)
    }
}

fn join_failures(failures: &[NamespaceFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that can occur while reconciling or running the engine.
#[derive(Error, Debug)]
pub enum ReplicatorError {
    /// Object store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Some namespaces of a propagation or cleanup pass failed.
    ///
    /// Effects already applied to the other namespaces stay in place; they
    /// are idempotent, so the whole pass is simply retried.
    #[error("{operation} failed in {} namespace(s): {}", .failures.len(), join_failures(.failures))]
    Partial {
        operation: String,
        failures: Vec<NamespaceFailure>,
    },

    /// A replica is missing its source-namespace annotation.
    #[error("Malformed replica {kind} {key}: missing annotation {annotation}")]
    MalformedReplica {
        kind: String,
        key: String,
        annotation: String,
    },

    /// An object believed to be a source carries an unexpected marker.
    #[error("Unexpected marker on {kind} {key}: expected {expected}, got {actual}")]
    UnexpectedMarker {
        kind: String,
        key: String,
        expected: String,
        actual: String,
    },

    /// No adapter is registered for the requested kind.
    #[error("No adapter registered for kind {0}")]
    UnknownKind(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicatorError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(StoreError::NotFound { .. }) => false,
            Self::Store(_) => true,
            Self::Partial { .. } => true,
            Self::MalformedReplica { .. } => false, // needs a human
            Self::UnexpectedMarker { .. } => false,
            Self::UnknownKind(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// True when the underlying store reported not-found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_not_found())
    }

    /// True when the underlying store reported a write conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_conflict())
    }

    /// Short label for metrics.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::Store(StoreError::NotFound { .. }) => "not_found",
            Self::Store(StoreError::Conflict { .. }) => "conflict",
            Self::Store(StoreError::AlreadyExists { .. }) => "already_exists",
            Self::Store(StoreError::Unavailable { .. }) => "unavailable",
            Self::Partial { .. } => "partial",
            Self::MalformedReplica { .. } => "malformed_replica",
            Self::UnexpectedMarker { .. } => "unexpected_marker",
            Self::UnknownKind(_) => "unknown_kind",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}
