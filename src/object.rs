//! Object model shared by the store, the adapters and the reconciler.
//!
//! Objects are kind-agnostic: generic metadata lives in [`ObjectMeta`], the
//! kind-specific payload (`data`, `rules`, `spec`, ...) lives in an untyped
//! JSON body that only [`KindAdapter`](crate::adapter::KindAdapter)s look
//! into.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

/// Identity of a namespaced object within one kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Same name, different namespace.
    pub fn in_namespace(&self, namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: self.name.clone(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Generic object metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    /// Assigned by the store on every write. `0` means "never persisted".
    #[serde(default)]
    pub resource_version: u64,
    /// Set by the store when deletion was requested but finalizers remain.
    #[serde(default)]
    pub deletion_timestamp: Option<SystemTime>,
}

impl ObjectMeta {
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// A stored object of some kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub kind: String,
    pub metadata: ObjectMeta,
    /// Kind-specific payload fields.
    #[serde(default)]
    pub body: Map<String, Value>,
}

impl Object {
    /// An empty object of `kind`; callers fill in metadata.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            metadata: ObjectMeta::default(),
            body: Map::new(),
        }
    }

    /// Builder-style helper, mostly for tests and embedders.
    pub fn named(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let mut obj = Self::new(kind);
        obj.metadata.namespace = namespace.into();
        obj.metadata.name = name.into();
        obj
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.annotations.insert(key.into(), value.into());
        self
    }

    pub fn with_field(mut self, field: impl Into<String>, value: Value) -> Self {
        self.body.insert(field.into(), value);
        self
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata.labels.get(key).map(String::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.get(key).map(String::as_str)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.is_deleting()
    }

    /// Compare everything a writer controls, ignoring store-assigned fields.
    pub fn same_content(&self, other: &Object) -> bool {
        self.kind == other.kind
            && self.body == other.body
            && self.metadata.labels == other.metadata.labels
            && self.metadata.annotations == other.metadata.annotations
            && self.metadata.finalizers == other.metadata.finalizers
    }
}

/// A list of objects of one kind, as returned by the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectList {
    pub kind: String,
    pub items: Vec<Object>,
}

/// A cluster namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub resource_version: u64,
    /// Set while the platform tears the namespace down.
    #[serde(default)]
    pub deletion_timestamp: Option<SystemTime>,
}

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn is_terminating(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// A single label requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Requirement {
    /// `key=value`
    Equals(String, String),
    /// `key` present with any value
    Exists(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::Exists(k) => labels.contains_key(k),
        }
    }
}

/// Conjunction of label requirements. Empty selects everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    pub requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            requirements: vec![Requirement::Equals(key.into(), value.into())],
        }
    }

    pub fn exists(key: impl Into<String>) -> Self {
        Self {
            requirements: vec![Requirement::Exists(key.into())],
        }
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}
