//! Engine state types.
//!
//! Defines the state machine for the replicator lifecycle.
//!
//! # State Transitions
//!
//! ```text
//!              start()
//! Created ───────────────────→ Running
//!    │                            │
//!    │ (never started)            │ shutdown()
//!    ↓                            ↓
//! Stopped ←──────────────── ShuttingDown
//!
//! Running ──(watch stream closed)──→ Failed
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `ReplicationEngine::new()`. Nothing spawned.
//! - **Running**: Watch dispatcher, workers and resync timer are live.
//! - **ShuttingDown**: `shutdown()` called. Workers finish their current key.
//! - **Stopped**: Every task has exited. Safe to drop.
//! - **Failed**: The store's change stream closed. The engine cannot continue.

/// State of the replication engine.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created but not started.
    ///
    /// Call [`start()`](super::ReplicationEngine::start) to begin reconciling.
    Created,

    /// Running and reconciling.
    Running,

    /// Shutting down gracefully.
    ///
    /// In-flight reconciles are allowed to finish.
    /// Transitions to `Stopped` when complete.
    ShuttingDown,

    /// Stopped.
    Stopped,

    /// Lost the store's change stream.
    ///
    /// Check logs for error details. Shut down and build a new engine.
    Failed,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Created => "Created",
            EngineState::Running => "Running",
            EngineState::ShuttingDown => "ShuttingDown",
            EngineState::Stopped => "Stopped",
            EngineState::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time health snapshot, built from in-process state only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Running and able to take work.
    pub ready: bool,
    /// Not failed.
    pub healthy: bool,
    /// Keys waiting for a worker.
    pub queue_depth: usize,
    /// Keys currently being reconciled.
    pub in_flight: usize,
    /// Configured worker count.
    pub workers: usize,
    /// Kinds under management.
    pub kinds: Vec<String>,
}
