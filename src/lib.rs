//! # Namespace Replicator
//!
//! Keeps designated *source* objects (secrets, config maps, roles, role
//! bindings, network policies, service accounts) mirrored as *replicas*
//! into every eligible namespace of a cluster-style object store.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                          namespace-replicator                             │
//! │                                                                           │
//! │  ┌─────────────┐    ┌──────────────┐    ┌──────────────────────────────┐  │
//! │  │ ObjectStore │───►│  Dispatcher  │───►│  WorkQueue (dedup, backoff)  │  │
//! │  │  (watch)    │    │ + resync     │    │                              │  │
//! │  └─────────────┘    └──────────────┘    └──────────────────────────────┘  │
//! │         ▲                                            │                    │
//! │         │                                            ▼                    │
//! │         │            ┌──────────────────────────────────────────┐         │
//! │         └────────────│ Reconciler (source / replica / namespace)│         │
//! │       writes         │ FinalizerManager · KindAdapter · Filter  │         │
//! │                      └──────────────────────────────────────────┘         │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Markers
//!
//! Everything the engine persists lives under one key prefix (default
//! `replicator.io`):
//!
//! | Key | Where | Values |
//! |---|---|---|
//! | `<prefix>/object-type` | object label | `replicated` (source), `replica` |
//! | `<prefix>/source-namespace` | replica annotation | source namespace |
//! | `<prefix>/finalizer` | finalizer | blocks deletion until cleanup |
//! | `<prefix>/namespace-type` | namespace label | `managed`, `ignored` |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use namespace_replicator::{MemoryStore, ReplicationEngine, ReplicatorConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut config = ReplicatorConfig::default();
//!     config.apply_env_overrides();
//!
//!     let store = Arc::new(MemoryStore::new());
//!     let mut engine = ReplicationEngine::with_log_events(store, config).expect("valid config");
//!     engine.start().await.expect("Failed to start");
//!
//!     // Engine runs until shutdown signal
//!     engine.shutdown().await;
//! }
//! ```

pub mod adapter;
pub mod config;
pub mod coordinator;
pub mod eligibility;
pub mod error;
pub mod events;
pub mod finalizer;
pub mod keys;
pub mod metrics;
pub mod object;
pub mod queue;
pub mod reconciler;
pub mod resilience;
pub mod store;

// Re-exports for convenience
pub use adapter::{AdapterRegistry, FieldCopyAdapter, KindAdapter};
pub use config::{BackoffConfig, EngineSettings, ReplicatorConfig};
pub use coordinator::{EngineState, HealthCheck, ReplicationEngine};
pub use eligibility::NamespaceFilter;
pub use error::{NamespaceFailure, ReplicatorError, Result, StoreError};
pub use events::{EventSink, LogEventSink, MemoryEventSink, ReplicationEvent};
pub use finalizer::FinalizerManager;
pub use keys::{strip_owned_keys, ObjectType, ReplicationKeys};
pub use object::{LabelSelector, Namespace, Object, ObjectKey, ObjectList};
pub use queue::{QueueKey, WorkQueue};
pub use reconciler::{Action, FanOutStats, Reconciler, RetireMode};
pub use resilience::{read_mutate_write, RetryConfig};
pub use store::{MemoryStore, ObjectStore, OperationResult, WatchEvent};
