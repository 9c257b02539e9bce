//! Event recording.
//!
//! The reconciler reports what it did to replicas (and what went wrong) as
//! events regarding the affected object. [`LogEventSink`] turns them into
//! log lines; [`MemoryEventSink`] keeps them for inspection.

use std::fmt;
use std::sync::Mutex;

use tracing::{info, warn};

use crate::object::ObjectKey;

pub const REASON_CREATED: &str = "ReplicaCreated";
pub const REASON_UPDATED: &str = "ReplicaUpdated";
pub const REASON_DELETED: &str = "ReplicaDeleted";
pub const REASON_SKIPPED: &str = "ReplicaSkipped";
pub const REASON_FAILED: &str = "ReplicationFailed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "Normal"),
            Self::Warning => write!(f, "Warning"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationEvent {
    pub event_type: EventType,
    pub reason: &'static str,
    pub kind: String,
    /// The object the event is about.
    pub key: ObjectKey,
    pub message: String,
}

impl ReplicationEvent {
    pub fn normal(reason: &'static str, kind: &str, key: &ObjectKey, message: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Normal,
            reason,
            kind: kind.to_string(),
            key: key.clone(),
            message: message.into(),
        }
    }

    pub fn warning(reason: &'static str, kind: &str, key: &ObjectKey, message: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Warning,
            reason,
            kind: kind.to_string(),
            key: key.clone(),
            message: message.into(),
        }
    }
}

/// Where events go.
pub trait EventSink: Send + Sync {
    fn record(&self, event: ReplicationEvent);
}

/// Sink that logs every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn record(&self, event: ReplicationEvent) {
        match event.event_type {
            EventType::Normal => info!(
                reason = event.reason,
                kind = %event.kind,
                key = %event.key,
                "{}",
                event.message
            ),
            EventType::Warning => warn!(
                reason = event.reason,
                kind = %event.kind,
                key = %event.key,
                "{}",
                event.message
            ),
        }
    }
}

/// Sink that keeps events in memory.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<ReplicationEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ReplicationEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Events with the given reason.
    pub fn with_reason(&self, reason: &str) -> Vec<ReplicationEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.reason == reason)
            .collect()
    }

    pub fn clear(&self) {
        match self.events.lock() {
            Ok(mut events) => events.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

impl EventSink for MemoryEventSink {
    fn record(&self, event: ReplicationEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}
