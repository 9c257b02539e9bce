//! Fuzz target for configuration parsing.
//!
//! Any input must either fail to parse or produce a config whose
//! validation and duration accessors never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use namespace_replicator::ReplicatorConfig;

fuzz_target!(|data: &str| {
    let Ok(config) = ReplicatorConfig::from_json_str(data) else {
        return;
    };

    let _ = config.validate();
    let _ = config.settings.resync_interval_duration();
    let _ = config.settings.shutdown_timeout_duration();
    let _ = config.settings.requeue.to_retry_config().delay_for_attempt(usize::MAX);
    let _ = config.settings.conflict_retry.to_retry_config().delay_for_attempt(3);
});
