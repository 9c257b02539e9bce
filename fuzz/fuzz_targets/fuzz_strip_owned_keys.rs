//! Fuzz target for copy-set stripping.
//!
//! Stripping must never panic, never keep a key under the prefix, and
//! never touch anything outside it.

#![no_main]

use libfuzzer_sys::fuzz_target;
use namespace_replicator::keys::{is_owned_key, strip_owned_keys};
use std::collections::BTreeMap;

fuzz_target!(|data: (&str, Vec<(String, String)>)| {
    let (prefix, pairs) = data;
    let map: BTreeMap<String, String> = pairs.into_iter().collect();

    let stripped = strip_owned_keys(&map, prefix);

    for key in stripped.keys() {
        assert!(!is_owned_key(key, prefix));
    }
    for (key, value) in &map {
        if !is_owned_key(key, prefix) {
            assert_eq!(stripped.get(key), Some(value));
        }
    }

    // Idempotent
    assert_eq!(strip_owned_keys(&stripped, prefix), stripped);
});
