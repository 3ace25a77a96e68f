//! Circuit breaker for peer calls.
//!
//! Prevents a failing peer from absorbing retries and timeouts: after enough
//! consecutive failures, calls fail fast until a cool-down elapses.
//!
//! # States
//!
//! - **Closed**: Normal operation, calls pass through. Any success resets the
//!   failure count.
//! - **Open**: Reached `failure_threshold` consecutive failures. Calls are
//!   rejected without running until `reset_timeout` has elapsed since the
//!   circuit opened.
//! - **HalfOpen**: The first call after the cool-down moves the breaker here
//!   and runs. The next success closes the circuit, the next failure reopens it.
//!
//! All transitions happen under a single mutex, so two concurrent failures
//! can never both observe "threshold minus one". [`CircuitBreaker::stats`]
//! reads atomic mirrors and never takes that mutex.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use register_replication::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
//! # async fn example() {
//! let breaker = CircuitBreaker::new("peer-7", CircuitConfig::default());
//!
//! match breaker.call(|| async { Ok::<u64, String>(42) }).await {
//!     Ok(version) => { /* success */ }
//!     Err(CircuitError::Rejected) => { /* circuit open, try another peer */ }
//!     Err(CircuitError::Inner(e)) => { /* the call itself failed */ }
//! }
//! # }
//! ```

use crate::metrics;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed = 0,
    /// Trial calls allowed after the cool-down
    HalfOpen = 1,
    /// Failing fast
    Open = 2,
}

impl CircuitState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::HalfOpen,
            2 => Self::Open,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open).
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected)
    }

    pub fn inner(&self) -> Option<&E> {
        match self {
            CircuitError::Inner(e) => Some(e),
            CircuitError::Rejected => None,
        }
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitError::Inner(e) => Some(e),
            CircuitError::Rejected => None,
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Cool-down between opening and the first trial call.
    pub reset_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Point-in-time view of a breaker, safe to hand to monitoring.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub calls_total: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
}

/// A named circuit breaker with metrics tracking.
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<BreakerInner>,

    // Mirrors written under `inner`, read lock-free by `stats()`
    state_mirror: AtomicU8,
    failure_mirror: AtomicU32,
    last_failure_ms: AtomicU64,
    opened_at_ms: AtomicU64,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
            }),
            state_mirror: AtomicU8::new(CircuitState::Closed as u8),
            failure_mirror: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(0),
            opened_at_ms: AtomicU64::new(0),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitConfig::default())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Execute an async operation through the circuit breaker.
    ///
    /// The closure is only invoked if the breaker admits the call.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        if !self.admit() {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            metrics::record_circuit_call(&self.name, "rejected");
            debug!(circuit = %self.name, "Circuit open, call rejected");
            return Err(CircuitError::Rejected);
        }

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Like [`call`](Self::call), but a rejection yields `fallback()` instead
    /// of an error.
    pub async fn call_with_fallback<F, Fut, T, E, FB>(&self, f: F, fallback: FB) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce() -> T,
    {
        match self.call(f).await {
            Ok(value) => Ok(value),
            Err(CircuitError::Rejected) => Ok(fallback()),
            Err(CircuitError::Inner(e)) => Err(e),
        }
    }

    /// Decide whether a call may run, promoting Open to HalfOpen once the
    /// cool-down has elapsed.
    fn admit(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            return true;
        }
        let cooled_down = inner
            .opened_at
            .map(|at| at.elapsed() >= self.config.reset_timeout)
            .unwrap_or(true);
        if cooled_down {
            self.transition(&mut inner, CircuitState::HalfOpen);
            true
        } else {
            false
        }
    }

    /// Record a successful call made outside [`call`](Self::call).
    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        metrics::record_circuit_call(&self.name, "success");

        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
                self.failure_mirror.store(0, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                inner.failure_count = 0;
                self.failure_mirror.store(0, Ordering::Release);
                self.transition(&mut inner, CircuitState::Closed);
            }
            // A call admitted before the circuit opened; the open window stands.
            CircuitState::Open => {}
        }
    }

    /// Record a failed call made outside [`call`](Self::call).
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        metrics::record_circuit_call(&self.name, "failure");

        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        self.failure_mirror.store(inner.failure_count, Ordering::Release);
        self.last_failure_ms.store(now_millis(), Ordering::Release);

        match inner.state {
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open);
            }
            _ => {}
        }
    }

    /// Force the breaker back to Closed with a zero failure count.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        self.failure_mirror.store(0, Ordering::Release);
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed);
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        self.state_mirror.store(to as u8, Ordering::Release);

        match to {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                self.opened_at_ms.store(now_millis(), Ordering::Release);
                warn!(
                    circuit = %self.name,
                    failures = inner.failure_count,
                    reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                    "Circuit breaker opened"
                );
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                self.opened_at_ms.store(0, Ordering::Release);
                info!(circuit = %self.name, from = %from, "Circuit breaker closed");
            }
            CircuitState::HalfOpen => {
                debug!(circuit = %self.name, "Circuit breaker half-open, allowing trial call");
            }
        }
        metrics::set_circuit_state(&self.name, to);
    }

    /// Current state as last published. An Open breaker whose cool-down has
    /// elapsed still reports Open until the next call.
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state_mirror.load(Ordering::Acquire))
    }

    /// Whether a call made now would run.
    pub fn is_call_permitted(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Open => inner
                .opened_at
                .map(|at| at.elapsed() >= self.config.reset_timeout)
                .unwrap_or(true),
            _ => true,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_mirror.load(Ordering::Acquire)
    }

    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Snapshot for observability. Does not take the transition lock.
    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            name: self.name.clone(),
            state: self.state(),
            failure_count: self.failure_count(),
            failure_threshold: self.config.failure_threshold,
            reset_timeout: self.config.reset_timeout,
            last_failure_time: millis_to_datetime(self.last_failure_ms.load(Ordering::Acquire)),
            opened_at: millis_to_datetime(self.opened_at_ms.load(Ordering::Acquire)),
            calls_total: self.calls_total.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("failure_count", &self.failure_count())
            .finish()
    }
}

fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(1) as u64
}

fn millis_to_datetime(ms: u64) -> Option<DateTime<Utc>> {
    if ms == 0 {
        return None;
    }
    Utc.timestamp_millis_opt(ms as i64).single()
}
