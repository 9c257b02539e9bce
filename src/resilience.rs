//! Resilience utilities: retry logic, backoff, rate limiting.
//!
//! - [`RetryConfig`]: exponential backoff policy, shared by the optimistic
//!   concurrency loop and the work queue's per-key requeue delay
//! - [`read_mutate_write`]: the read → mutate → write cycle, retried on
//!   write conflicts
//! - [`RateLimiter`]: token bucket throttling reconcile admission
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use namespace_replicator::resilience::{RateLimiter, RateLimitConfig};
//!
//! // max 100 reconciles/sec with a burst of 20
//! let limiter = RateLimiter::new(RateLimitConfig { burst_size: 20, refill_rate: 100 });
//! limiter.acquire().await; // waits if over limit
//! # }
//! ```

use std::future::Future;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use tracing::debug;

use crate::error::{ReplicatorError, StoreError};

/// Exponential backoff policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (first try included).
    /// `usize::MAX` retries forever.
    pub max_attempts: usize,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for exponential backoff.
    pub max_delay: Duration,

    /// Backoff multiplier (2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::conflict()
    }
}

impl RetryConfig {
    /// Bounded retry for optimistic concurrency conflicts.
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        10ms
    /// 2        20ms
    /// 3        40ms
    /// 4        80ms
    /// (give up after 5 attempts)
    /// ```
    pub fn conflict() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
        }
    }

    /// Per-key requeue delay of the work queue.
    ///
    /// Never gives up: a failing key is retried forever, 5ms doubling up
    /// to ~16 minutes.
    pub fn requeue() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            backoff_factor: 2.0,
        }
    }

    /// Fast retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(20),
            backoff_factor: 2.0,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        // Clamp the exponent; powi overflows to inf long before this matters.
        let exponent = (attempt - 1).min(i32::MAX as usize) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        if delay_secs <= 0.0 {
            // Only reachable with an unvalidated factor below zero.
            return self.initial_delay.min(self.max_delay);
        }

        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }
}

// =============================================================================
// Read-Mutate-Write
// =============================================================================

/// Errors that can report an optimistic concurrency failure.
pub trait ConflictAware {
    /// True if re-reading and re-applying the mutation may succeed.
    fn is_write_conflict(&self) -> bool;
}

impl ConflictAware for StoreError {
    fn is_write_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::AlreadyExists { .. })
    }
}

impl ConflictAware for ReplicatorError {
    fn is_write_conflict(&self) -> bool {
        match self {
            ReplicatorError::Store(e) => e.is_write_conflict(),
            _ => false,
        }
    }
}

/// Result of one [`read_mutate_write`] cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome<T, O> {
    /// The mutation changed the value and the write went through.
    Written(O),
    /// The fresh value was already in the desired state; nothing was written.
    Unchanged(T),
}

impl<T, O> WriteOutcome<T, O> {
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written(_))
    }
}

/// Re-read, mutate, write; on a write conflict start over.
///
/// `mutate` returns whether it changed the value. When it reports no change
/// the cycle ends without a write. Non-conflict errors from either `read`
/// or `write` end the cycle immediately. After `policy.max_attempts` conflicts
/// the last conflict is returned.
pub async fn read_mutate_write<T, O, E, R, RF, M, W, WF>(
    policy: &RetryConfig,
    mut read: R,
    mut mutate: M,
    mut write: W,
) -> Result<WriteOutcome<T, O>, E>
where
    E: ConflictAware + std::fmt::Display,
    R: FnMut() -> RF,
    RF: Future<Output = Result<T, E>>,
    M: FnMut(&mut T) -> bool,
    W: FnMut(T) -> WF,
    WF: Future<Output = Result<O, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0usize;

    loop {
        attempt += 1;

        let mut value = read().await?;
        if !mutate(&mut value) {
            return Ok(WriteOutcome::Unchanged(value));
        }

        match write(value).await {
            Ok(written) => return Ok(WriteOutcome::Written(written)),
            Err(e) if e.is_write_conflict() && attempt < max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                debug!(attempt, ?delay, error = %e, "Write conflict, retrying");
                crate::metrics::record_conflict_retry();
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Configuration for rate limiting.
///
/// Uses a token bucket algorithm: tokens refill at `refill_rate` per second,
/// up to `burst_size` tokens. Each reconcile consumes one token.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 100 reconciles/sec with burst of 200.
    fn default() -> Self {
        Self {
            burst_size: 200,
            refill_rate: 100,
        }
    }
}

/// Token bucket rate limiter.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
            config,
        }
    }

    /// Acquire a permit, waiting until one is available.
    ///
    /// This method is cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Try to acquire a permit without waiting.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").field("config", &self.config).finish()
    }
}
