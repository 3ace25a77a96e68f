//! Resilience utilities: retry backoff, heartbeat timeouts, rate limiting,
//! bulkheads.
//!
//! - [`retry_backoff`]: capped exponential delay as a pure function of the attempt
//! - [`RetryConfig`]: bounded retry loop settings for store connections
//! - [`HeartbeatValidator`]: decides timeout and failover from heartbeat silence
//! - [`RateLimiter`]: token bucket for outbound gossip sends
//! - [`Bulkhead`]: semaphore bounding concurrent sync attempts
//!
//! # Example
//!
//! ```rust
//! use register_replication::resilience::{retry_backoff, BackoffPolicy};
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy::default();
//! assert_eq!(retry_backoff(0, &policy), Duration::ZERO);
//! assert_eq!(retry_backoff(3, &policy), Duration::from_secs(4));
//! assert_eq!(retry_backoff(9, &policy), Duration::from_secs(60));
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

// =============================================================================
// Retry Backoff
// =============================================================================

/// Parameters of the capped exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Growth factor between consecutive retries.
    pub multiplier: f64,
    /// Ceiling on any single delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    /// 1s, doubling, capped at 60s.
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(60),
        }
    }
}

/// Delay to wait before retry number `attempt`.
///
/// `attempt <= 0` means nothing has failed yet and yields zero. Otherwise
/// the delay is `min(max, initial * multiplier^(attempt - 1))`.
///
/// ```text
/// attempt  1  2  3  4  5   6   7   8   9   10
/// delay    1  2  4  8  16  32  60  60  60  60   (seconds, defaults)
/// ```
pub fn retry_backoff(attempt: i64, policy: &BackoffPolicy) -> Duration {
    if attempt <= 0 {
        return Duration::ZERO;
    }

    let exponent = (attempt - 1).min(i64::from(i32::MAX)) as i32;
    let delay_secs = policy.initial.as_secs_f64() * policy.multiplier.powi(exponent);

    if !delay_secs.is_finite() || delay_secs >= policy.max.as_secs_f64() {
        return policy.max;
    }
    Duration::from_secs_f64(delay_secs.max(0.0))
}

/// Configuration for connection retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of connection attempts.
    pub max_attempts: usize,

    /// Backoff between attempts.
    pub backoff: BackoffPolicy,

    /// Timeout for each individual connection attempt.
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffPolicy {
                initial: Duration::from_millis(200),
                multiplier: 2.0,
                max: Duration::from_secs(5),
            },
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Startup connection to the advertisement store.
    ///
    /// Gives up after a handful of attempts so the node can fall back to
    /// in-memory operation instead of blocking startup.
    pub fn startup(connection_timeout: Duration) -> Self {
        Self {
            connection_timeout,
            ..Default::default()
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 2,
            backoff: BackoffPolicy {
                initial: Duration::from_millis(10),
                multiplier: 2.0,
                max: Duration::from_millis(50),
            },
            connection_timeout: Duration::from_millis(500),
        }
    }

    /// Delay before retry number `attempt` (1-indexed; 0 means no delay).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        retry_backoff(attempt as i64, &self.backoff)
    }
}

// =============================================================================
// Heartbeat Validation
// =============================================================================

/// Heartbeat windows for peer liveness.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatConfig {
    /// Expected cadence of heartbeats.
    pub interval: Duration,
    /// Silence longer than this marks the peer as timed out.
    pub timeout: Duration,
    /// Missed heartbeats at which failover is recommended.
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(30),
            max_missed: 2,
        }
    }
}

/// True once the silence since the last heartbeat exceeds `timeout`.
pub fn is_heartbeat_timed_out(elapsed: Duration, timeout: Duration) -> bool {
    elapsed > timeout
}

/// Number of whole heartbeat intervals that passed without a heartbeat.
pub fn missed_heartbeats(elapsed: Duration, interval: Duration) -> u32 {
    if interval.is_zero() {
        return 0;
    }
    let missed = elapsed.as_nanos() / interval.as_nanos();
    u32::try_from(missed).unwrap_or(u32::MAX)
}

/// True once consecutive misses reach `threshold`.
pub fn should_failover(consecutive_misses: u32, threshold: u32) -> bool {
    consecutive_misses >= threshold
}

/// Liveness verdict for a single peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    /// Heard from within the timeout window.
    Healthy,
    /// Silent past the timeout but below the failover threshold.
    TimedOut { missed: u32 },
    /// Enough heartbeats missed that traffic should move elsewhere.
    FailoverRecommended { missed: u32 },
}

impl HeartbeatStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    pub fn needs_failover(&self) -> bool {
        matches!(self, Self::FailoverRecommended { .. })
    }
}

/// Applies a [`HeartbeatConfig`] to observed silence.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatValidator {
    config: HeartbeatConfig,
}

impl HeartbeatValidator {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Classify a peer given the time since its last heartbeat.
    pub fn evaluate(&self, since_last_heartbeat: Duration) -> HeartbeatStatus {
        if !is_heartbeat_timed_out(since_last_heartbeat, self.config.timeout) {
            return HeartbeatStatus::Healthy;
        }
        // A timed-out peer has missed at least one beat even if the
        // configured interval is longer than the timeout.
        let missed = missed_heartbeats(since_last_heartbeat, self.config.interval).max(1);
        if should_failover(missed, self.config.max_missed) {
            HeartbeatStatus::FailoverRecommended { missed }
        } else {
            HeartbeatStatus::TimedOut { missed }
        }
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Configuration for rate limiting.
///
/// Token bucket: tokens refill at `refill_rate` per second, up to
/// `burst_size` tokens. Each send consumes one token.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst_size: 100,
            refill_rate: 1000,
        }
    }
}

/// Token bucket rate limiter for outbound gossip.
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

    /// Wait until a send is permitted. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Take a token if one is available right now.
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

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// Error when bulkhead is closed or full.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead full: max {max_concurrent} concurrent operations")]
pub struct BulkheadFull {
    pub max_concurrent: usize,
}

/// Limits how many sync attempts run at once.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Acquire a permit, waiting if necessary. The slot frees on drop.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadFull> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull {
                max_concurrent: self.max_concurrent,
            })
    }

    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}
