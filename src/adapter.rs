//! Per-kind capability adapters.
//!
//! The reconciler is kind-agnostic. Everything it needs to know about a
//! concrete kind (how to make an empty instance, which payload fields a
//! replica mirrors) sits behind [`KindAdapter`].

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{ReplicatorError, Result};
use crate::object::{Object, ObjectList};

pub const SECRET: &str = "Secret";
pub const CONFIG_MAP: &str = "ConfigMap";
pub const ROLE: &str = "Role";
pub const ROLE_BINDING: &str = "RoleBinding";
pub const NETWORK_POLICY: &str = "NetworkPolicy";
pub const SERVICE_ACCOUNT: &str = "ServiceAccount";

/// Capabilities the reconciler needs from one object kind.
pub trait KindAdapter: Send + Sync {
    /// Kind name as used by the store.
    fn kind(&self) -> &str;

    /// A blank instance of this kind.
    fn empty_object(&self) -> Object {
        Object::new(self.kind())
    }

    /// A blank list of this kind.
    fn empty_object_list(&self) -> ObjectList {
        ObjectList {
            kind: self.kind().to_string(),
            items: Vec::new(),
        }
    }

    /// Flatten a list into its items.
    fn list_to_array(&self, list: ObjectList) -> Vec<Object> {
        list.items
    }

    /// Copy the kind-specific payload of `source` onto `target`.
    ///
    /// Metadata is not touched; the reconciler owns the copy set.
    fn replicate(&self, source: &Object, target: &mut Object);
}

/// Adapter that mirrors a fixed set of top-level body fields.
///
/// A field absent on the source is removed from the target.
#[derive(Debug, Clone)]
pub struct FieldCopyAdapter {
    kind: &'static str,
    fields: &'static [&'static str],
}

impl FieldCopyAdapter {
    pub const fn new(kind: &'static str, fields: &'static [&'static str]) -> Self {
        Self { kind, fields }
    }

    pub const fn secret() -> Self {
        Self::new(SECRET, &["type", "data", "stringData", "immutable"])
    }

    pub const fn config_map() -> Self {
        Self::new(CONFIG_MAP, &["data", "binaryData", "immutable"])
    }

    pub const fn role() -> Self {
        Self::new(ROLE, &["rules"])
    }

    pub const fn role_binding() -> Self {
        Self::new(ROLE_BINDING, &["subjects", "roleRef"])
    }

    pub const fn network_policy() -> Self {
        Self::new(NETWORK_POLICY, &["spec"])
    }

    pub const fn service_account() -> Self {
        Self::new(
            SERVICE_ACCOUNT,
            &["imagePullSecrets", "automountServiceAccountToken"],
        )
    }

    pub fn fields(&self) -> &[&'static str] {
        self.fields
    }
}

impl KindAdapter for FieldCopyAdapter {
    fn kind(&self) -> &str {
        self.kind
    }

    fn replicate(&self, source: &Object, target: &mut Object) {
        for field in self.fields {
            match source.body.get(*field) {
                Some(value) => {
                    target.body.insert((*field).to_string(), value.clone());
                }
                None => {
                    target.body.remove(*field);
                }
            }
        }
    }
}

/// Adapters by kind name.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn KindAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in kind.
    pub fn with_builtin_kinds() -> Self {
        let mut registry = Self::new();
        for adapter in [
            FieldCopyAdapter::secret(),
            FieldCopyAdapter::config_map(),
            FieldCopyAdapter::role(),
            FieldCopyAdapter::role_binding(),
            FieldCopyAdapter::network_policy(),
            FieldCopyAdapter::service_account(),
        ] {
            registry.register(Arc::new(adapter));
        }
        registry
    }

    /// Built-in adapters restricted to `kinds`.
    pub fn for_kinds<S: AsRef<str>>(kinds: &[S]) -> Result<Self> {
        let builtin = Self::with_builtin_kinds();
        let mut registry = Self::new();
        for kind in kinds {
            registry.register(builtin.get(kind.as_ref())?);
        }
        Ok(registry)
    }

    /// Add or replace the adapter for its kind.
    pub fn register(&mut self, adapter: Arc<dyn KindAdapter>) {
        self.adapters.insert(adapter.kind().to_string(), adapter);
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn KindAdapter>> {
        self.adapters
            .get(kind)
            .cloned()
            .ok_or_else(|| ReplicatorError::UnknownKind(kind.to_string()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.adapters.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
