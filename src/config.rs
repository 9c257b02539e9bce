//! Configuration for the replicator.
//!
//! Configuration is passed to [`ReplicationEngine::new()`](crate::ReplicationEngine::new)
//! and can be constructed programmatically or deserialized from JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use namespace_replicator::config::ReplicatorConfig;
//!
//! let config = ReplicatorConfig {
//!     operator_namespace: Some("replicator-system".into()),
//!     kinds: vec!["Secret".into(), "ConfigMap".into()],
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicatorConfig
//! ├── key_prefix: String                # "replicator.io"
//! ├── operator_namespace: Option<String>  # never a target (env: OPERATOR_NAMESPACE)
//! ├── system_namespace_prefix: String   # "kube-"
//! ├── kinds: Vec<String>                # kinds to replicate
//! └── settings: EngineSettings
//!     ├── workers, resync_interval, shutdown_timeout
//!     ├── requeue: BackoffConfig        # per-key failure backoff
//!     ├── conflict_retry: BackoffConfig # read-mutate-write retries
//!     └── rate_limit_*                  # reconcile admission
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "key_prefix": "replicator.io",
//!   "operator_namespace": "replicator-system",
//!   "kinds": ["Secret", "ConfigMap", "Role"],
//!   "settings": {
//!     "workers": 50,
//!     "resync_interval": "5m",
//!     "requeue": { "initial_delay": "5ms", "max_delay": "1000s" }
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::adapter::AdapterRegistry;
use crate::eligibility::{NamespaceFilter, DEFAULT_SYSTEM_PREFIX};
use crate::error::{ReplicatorError, Result};
use crate::keys::{ReplicationKeys, DEFAULT_PREFIX};
use crate::resilience::{RateLimitConfig, RetryConfig};

/// Environment variable naming the namespace the operator runs in.
pub const OPERATOR_NAMESPACE_ENV: &str = "OPERATOR_NAMESPACE";

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to ReplicationEngine::new()
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Prefix of every label, annotation and finalizer the engine owns.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// The operator's own namespace; never receives replicas unless it is
    /// explicitly labelled `managed`.
    #[serde(default)]
    pub operator_namespace: Option<String>,

    /// Namespaces starting with this prefix are platform-owned.
    #[serde(default = "default_system_prefix")]
    pub system_namespace_prefix: String,

    /// Kinds to replicate.
    #[serde(default = "default_kinds")]
    pub kinds: Vec<String>,

    #[serde(default)]
    pub settings: EngineSettings,
}

fn default_key_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_system_prefix() -> String {
    DEFAULT_SYSTEM_PREFIX.to_string()
}

fn default_kinds() -> Vec<String> {
    AdapterRegistry::with_builtin_kinds().kinds()
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            operator_namespace: None,
            system_namespace_prefix: default_system_prefix(),
            kinds: default_kinds(),
            settings: EngineSettings::default(),
        }
    }
}

impl ReplicatorConfig {
    /// Small, fast config for tests.
    pub fn for_testing() -> Self {
        Self {
            operator_namespace: Some("replicator-system".to_string()),
            settings: EngineSettings::for_testing(),
            ..Default::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ReplicatorError::Config(format!("invalid config: {}", e)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ReplicatorError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&raw)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ns) = lookup(OPERATOR_NAMESPACE_ENV) {
            let ns = ns.trim().to_string();
            if !ns.is_empty() {
                self.operator_namespace = Some(ns);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.is_empty() || self.key_prefix.contains('/') {
            return Err(ReplicatorError::Config(format!(
                "key_prefix must be a non-empty DNS-style prefix without '/': {:?}",
                self.key_prefix
            )));
        }
        if self.kinds.is_empty() {
            return Err(ReplicatorError::Config("at least one kind must be enabled".into()));
        }
        AdapterRegistry::for_kinds(&self.kinds)
            .map_err(|e| ReplicatorError::Config(e.to_string()))?;
        self.settings.validate()
    }

    pub fn keys(&self) -> ReplicationKeys {
        ReplicationKeys::new(self.key_prefix.clone())
    }

    pub fn namespace_filter(&self) -> NamespaceFilter {
        NamespaceFilter::new(
            self.keys(),
            self.system_namespace_prefix.clone(),
            self.operator_namespace.clone(),
        )
    }

    /// Adapters for the enabled kinds.
    pub fn adapters(&self) -> Result<AdapterRegistry> {
        AdapterRegistry::for_kinds(&self.kinds)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EngineSettings: workers, resync, shutdown, retry and rate limits
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Size of the reconcile worker pool.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How often every object of every kind is re-enqueued, as a duration
    /// string (e.g. "10m"). "0s" disables the periodic pass; the initial
    /// pass at startup always runs.
    #[serde(default = "default_resync_interval")]
    pub resync_interval: String,

    /// How long shutdown waits for in-flight reconciles.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: String,

    /// Per-key backoff after a failed reconcile.
    #[serde(default = "BackoffConfig::requeue")]
    pub requeue: BackoffConfig,

    /// Retry policy of the read-mutate-write cycle.
    #[serde(default = "BackoffConfig::conflict")]
    pub conflict_retry: BackoffConfig,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting (reconcile admission)
    // ─────────────────────────────────────────────────────────────────────────

    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Reconciles per second (sustained rate).
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Burst allowance above the sustained rate.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_workers() -> usize {
    100
}

fn default_resync_interval() -> String {
    "10m".to_string()
}

fn default_shutdown_timeout() -> String {
    "30s".to_string()
}

fn default_false() -> bool {
    false
}

fn default_rate_limit_per_sec() -> u32 {
    100
}

fn default_rate_limit_burst() -> u32 {
    200
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            resync_interval: default_resync_interval(),
            shutdown_timeout: default_shutdown_timeout(),
            requeue: BackoffConfig::requeue(),
            conflict_retry: BackoffConfig::conflict(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

impl EngineSettings {
    pub fn for_testing() -> Self {
        Self {
            workers: 4,
            resync_interval: "0s".to_string(),
            shutdown_timeout: "2s".to_string(),
            requeue: BackoffConfig {
                initial_delay: "1ms".to_string(),
                max_delay: "50ms".to_string(),
                backoff_factor: 2.0,
                max_attempts: None,
            },
            conflict_retry: BackoffConfig {
                initial_delay: "1ms".to_string(),
                max_delay: "20ms".to_string(),
                backoff_factor: 2.0,
                max_attempts: Some(5),
            },
            ..Default::default()
        }
    }

    /// Parse `resync_interval`; `None` when the periodic pass is disabled.
    pub fn resync_interval_duration(&self) -> Option<Duration> {
        let interval = humantime::parse_duration(&self.resync_interval).unwrap_or(Duration::from_secs(600));
        if interval.is_zero() {
            None
        } else {
            Some(interval)
        }
    }

    pub fn shutdown_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.shutdown_timeout).unwrap_or(Duration::from_secs(30))
    }

    /// Create rate limit configuration; `None` if disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(ReplicatorError::Config("workers must be at least 1".into()));
        }
        for (field, value) in [
            ("resync_interval", &self.resync_interval),
            ("shutdown_timeout", &self.shutdown_timeout),
        ] {
            humantime::parse_duration(value)
                .map_err(|e| ReplicatorError::Config(format!("{}: {:?}: {}", field, value, e)))?;
        }
        self.requeue.validate("requeue")?;
        self.conflict_retry.validate("conflict_retry")?;
        if self.rate_limit_enabled && self.rate_limit_per_sec == 0 {
            return Err(ReplicatorError::Config(
                "rate_limit_per_sec must be positive when rate limiting is enabled".into(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BackoffConfig: serialized form of RetryConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_delay")]
    pub initial_delay: String,

    #[serde(default = "default_max_delay")]
    pub max_delay: String,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Attempts before giving up; absent means retry forever.
    #[serde(default)]
    pub max_attempts: Option<usize>,
}

fn default_initial_delay() -> String {
    "10ms".to_string()
}

fn default_max_delay() -> String {
    "1s".to_string()
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl BackoffConfig {
    /// 5ms doubling to 1000s, forever.
    pub fn requeue() -> Self {
        Self {
            initial_delay: "5ms".to_string(),
            max_delay: "1000s".to_string(),
            backoff_factor: 2.0,
            max_attempts: None,
        }
    }

    /// 10ms doubling to 1s, five attempts.
    pub fn conflict() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_factor: 2.0,
            max_attempts: Some(5),
        }
    }

    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.unwrap_or(usize::MAX),
            initial_delay: humantime::parse_duration(&self.initial_delay).unwrap_or(Duration::from_millis(10)),
            max_delay: humantime::parse_duration(&self.max_delay).unwrap_or(Duration::from_secs(1)),
            backoff_factor: self.backoff_factor,
        }
    }

    fn validate(&self, field: &str) -> Result<()> {
        let initial = humantime::parse_duration(&self.initial_delay)
            .map_err(|e| ReplicatorError::Config(format!("{}.initial_delay: {}", field, e)))?;
        let max = humantime::parse_duration(&self.max_delay)
            .map_err(|e| ReplicatorError::Config(format!("{}.max_delay: {}", field, e)))?;
        if initial > max {
            return Err(ReplicatorError::Config(format!(
                "{}: initial_delay exceeds max_delay",
                field
            )));
        }
        if !(self.backoff_factor >= 1.0) {
            return Err(ReplicatorError::Config(format!(
                "{}: backoff_factor must be >= 1.0",
                field
            )));
        }
        if self.max_attempts == Some(0) {
            return Err(ReplicatorError::Config(format!("{}: max_attempts must be positive", field)));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
