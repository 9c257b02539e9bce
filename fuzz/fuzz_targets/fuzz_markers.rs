//! Fuzz target for marker parsing and namespace eligibility.
//!
//! Arbitrary label values must classify without panicking, and the
//! ignored/managed overrides must always win over the name rules.

#![no_main]

use libfuzzer_sys::fuzz_target;
use namespace_replicator::keys::{NamespaceType, ObjectType, ReplicationKeys};
use namespace_replicator::{Namespace, NamespaceFilter};

fuzz_target!(|data: (&str, &str, Option<&str>)| {
    let (name, value, operator_ns) = data;

    match ObjectType::from_label(Some(value)) {
        ObjectType::Unknown(raw) => assert_eq!(raw, value),
        other => assert_eq!(other.to_string(), value),
    }

    let keys = ReplicationKeys::default();
    let filter = NamespaceFilter::new(keys.clone(), "kube-", operator_ns.map(str::to_string));
    let ns = Namespace::new(name).with_label(keys.namespace_type(), value);
    let eligible = filter.is_eligible(&ns);

    match NamespaceType::from_label(Some(value)) {
        NamespaceType::Ignored => assert!(!eligible),
        NamespaceType::Managed => assert!(eligible),
        _ => {
            let unlabelled = Namespace::new(name);
            assert_eq!(eligible, filter.is_eligible(&unlabelled));
        }
    }
});
