//! Engine-owned label, annotation and finalizer keys.
//!
//! Every key the engine reads or writes lives under one configurable prefix
//! (`replicator.io` by default):
//!
//! ```text
//! <prefix>/namespace-type    namespace label     managed | ignored
//! <prefix>/object-type       object label        replicated | replica
//! <prefix>/source-namespace  object annotation   <namespace>
//! <prefix>/finalizer         object finalizer
//! ```
//!
//! Keys under the prefix are never copied from a source to its replicas;
//! [`strip_owned_keys`] is applied at every copy boundary.

use std::collections::BTreeMap;
use std::fmt;

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "replicator.io";

/// Marker value for source objects.
pub const REPLICATED: &str = "replicated";

/// Marker value for replica objects.
pub const REPLICA: &str = "replica";

/// Namespace label value that forces eligibility.
pub const MANAGED: &str = "managed";

/// Namespace label value that forces ineligibility.
pub const IGNORED: &str = "ignored";

/// Value of the `object-type` label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectType {
    /// No marker at all.
    Unmarked,
    /// A user-owned source.
    Replicated,
    /// An engine-owned replica.
    Replica,
    /// Some value this engine does not understand.
    Unknown(String),
}

impl ObjectType {
    pub fn from_label(value: Option<&str>) -> Self {
        match value {
            None => Self::Unmarked,
            Some(REPLICATED) => Self::Replicated,
            Some(REPLICA) => Self::Replica,
            Some(other) => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unmarked => write!(f, "<unmarked>"),
            Self::Replicated => write!(f, "{}", REPLICATED),
            Self::Replica => write!(f, "{}", REPLICA),
            Self::Unknown(v) => write!(f, "{}", v),
        }
    }
}

/// Value of the `namespace-type` label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceType {
    /// No label: defaults apply.
    Default,
    Managed,
    Ignored,
    /// Unrecognised value: treated like no label.
    Unknown(String),
}

impl NamespaceType {
    pub fn from_label(value: Option<&str>) -> Self {
        match value {
            None => Self::Default,
            Some(MANAGED) => Self::Managed,
            Some(IGNORED) => Self::Ignored,
            Some(other) => Self::Unknown(other.to_string()),
        }
    }
}

/// The fully-qualified keys derived from one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationKeys {
    prefix: String,
    namespace_type: String,
    object_type: String,
    source_namespace: String,
    finalizer: String,
}

impl ReplicationKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            namespace_type: format!("{}/namespace-type", prefix),
            object_type: format!("{}/object-type", prefix),
            source_namespace: format!("{}/source-namespace", prefix),
            finalizer: format!("{}/finalizer", prefix),
            prefix,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn namespace_type(&self) -> &str {
        &self.namespace_type
    }

    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    pub fn source_namespace(&self) -> &str {
        &self.source_namespace
    }

    pub fn finalizer(&self) -> &str {
        &self.finalizer
    }

    /// Classify a label map by its `object-type` marker.
    pub fn object_type_of(&self, labels: &BTreeMap<String, String>) -> ObjectType {
        ObjectType::from_label(labels.get(&self.object_type).map(String::as_str))
    }

    /// Labels a replica of `source_labels` must carry.
    pub fn replica_labels(&self, source_labels: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut labels = strip_owned_keys(source_labels, &self.prefix);
        labels.insert(self.object_type.clone(), REPLICA.to_string());
        labels
    }

    /// Annotations a replica of a source in `source_namespace` must carry.
    pub fn replica_annotations(
        &self,
        source_annotations: &BTreeMap<String, String>,
        source_namespace: &str,
    ) -> BTreeMap<String, String> {
        let mut annotations = strip_owned_keys(source_annotations, &self.prefix);
        annotations.insert(self.source_namespace.clone(), source_namespace.to_string());
        annotations
    }
}

impl Default for ReplicationKeys {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

/// True if `key` lives under `prefix` (`<prefix>/...`).
pub fn is_owned_key(key: &str, prefix: &str) -> bool {
    key.strip_prefix(prefix)
        .map(|rest| rest.starts_with('/'))
        .unwrap_or(false)
}

/// Copy of `map` without the keys under `prefix`.
pub fn strip_owned_keys(map: &BTreeMap<String, String>, prefix: &str) -> BTreeMap<String, String> {
    map.iter()
        .filter(|(k, _)| !is_owned_key(k, prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
