//! Namespace eligibility filter.
//!
//! Decides whether a namespace should receive replicas:
//!
//! 1. `namespace-type=ignored` → never.
//! 2. `namespace-type=managed` → always, overriding the defaults below.
//! 3. Otherwise: not if the name starts with the system prefix (`kube-`) or
//!    equals the operator's own namespace; yes for everything else.
//!
//! The filter is pure and holds no cache; callers evaluate it against a
//! freshly-read namespace on every pass.

use crate::keys::{NamespaceType, ReplicationKeys};
use crate::object::Namespace;

/// Default prefix of platform-owned namespaces.
pub const DEFAULT_SYSTEM_PREFIX: &str = "kube-";

#[derive(Debug, Clone)]
pub struct NamespaceFilter {
    keys: ReplicationKeys,
    system_prefix: String,
    operator_namespace: Option<String>,
}

impl NamespaceFilter {
    pub fn new(
        keys: ReplicationKeys,
        system_prefix: impl Into<String>,
        operator_namespace: Option<String>,
    ) -> Self {
        Self {
            keys,
            system_prefix: system_prefix.into(),
            operator_namespace: operator_namespace.filter(|ns| !ns.is_empty()),
        }
    }

    /// Whether `namespace` is a valid replication target.
    pub fn is_eligible(&self, namespace: &Namespace) -> bool {
        let label = namespace
            .labels
            .get(self.keys.namespace_type())
            .map(String::as_str);

        match NamespaceType::from_label(label) {
            NamespaceType::Ignored => false,
            NamespaceType::Managed => true,
            NamespaceType::Default | NamespaceType::Unknown(_) => self.eligible_by_name(&namespace.name),
        }
    }

    /// Like [`is_eligible`](Self::is_eligible) but also rejects namespaces
    /// that are being torn down.
    pub fn accepts_replicas(&self, namespace: &Namespace) -> bool {
        !namespace.is_terminating() && self.is_eligible(namespace)
    }

    fn eligible_by_name(&self, name: &str) -> bool {
        if !self.system_prefix.is_empty() && name.starts_with(&self.system_prefix) {
            return false;
        }
        if self.operator_namespace.as_deref() == Some(name) {
            return false;
        }
        true
    }
}

impl Default for NamespaceFilter {
    fn default() -> Self {
        Self::new(ReplicationKeys::default(), DEFAULT_SYSTEM_PREFIX, None)
    }
}
