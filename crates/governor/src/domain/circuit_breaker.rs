//! Circuit breaker guarding calls into an unreliable downstream.
//!
//! State transitions are evaluated lazily when a call arrives; there is no
//! timer thread. `Closed` opens after `failure_threshold` failures without an
//! intervening success, `Open` admits a trial call once `timeout` has elapsed since
//! the last failure, and `HalfOpen` closes after `success_threshold` successes
//! or reopens on any failure.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout_ms: u64,
    pub success_threshold: u32,
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_ms: 60_000,
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        f.write_str(name)
    }
}

/// Outcome of a call that did not produce a value.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// The breaker is open; the protected call was not invoked.
    #[error("circuit breaker is open")]
    Rejected,
    /// The protected call ran and failed.
    #[error("protected call failed: {0}")]
    Failed(E),
}

impl<E> BreakerError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, BreakerError::Rejected)
    }

    pub fn into_failure(self) -> Option<E> {
        match self {
            BreakerError::Rejected => None,
            BreakerError::Failed(err) => Some(err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    /// Failures counted towards the current opening decision.
    pub failure_count: u32,
    pub success_rate: f64,
    pub since_last_failure_ms: Option<u64>,
    pub since_last_success_ms: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
    last_failure: Option<Instant>,
    last_success: Option<Instant>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            rejected_calls: 0,
            last_failure: None,
            last_success: None,
        }
    }

    fn transition(&mut self, to: BreakerState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        match to {
            BreakerState::HalfOpen => self.success_count = 0,
            BreakerState::Closed => {
                self.failure_count = 0;
                self.success_count = 0;
            }
            BreakerState::Open => {}
        }
        if to == BreakerState::Open {
            tracing::warn!(%from, %to, failures = self.failure_count, "circuit breaker opened");
        } else {
            tracing::info!(%from, %to, "circuit breaker state changed");
        }
    }
}

pub struct CircuitBreaker {
    cfg: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        debug_assert!(cfg.failure_threshold > 0 && cfg.success_threshold > 0);
        Self {
            cfg,
            inner: Mutex::new(Inner::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` unless the breaker is open.
    pub fn execute<T, E, F>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.execute_at(Instant::now(), f)
    }

    /// Deterministic variant useful for testing; `now` stamps both the
    /// admission decision and the recorded outcome.
    pub fn execute_at<T, E, F>(&self, now: Instant, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if !self.try_acquire_at(now) {
            return Err(BreakerError::Rejected);
        }
        match f() {
            Ok(value) => {
                self.record_success_at(now);
                Ok(value)
            }
            Err(err) => {
                self.record_failure_at(now);
                Err(BreakerError::Failed(err))
            }
        }
    }

    /// Run `f`, answering with `fallback()` when the breaker rejects the call
    /// or the call fails.
    pub fn execute_or<T, E, F, G>(&self, f: F, fallback: G) -> T
    where
        F: FnOnce() -> Result<T, E>,
        G: FnOnce() -> T,
    {
        self.execute(f).unwrap_or_else(|_| fallback())
    }

    /// Ask permission for a call whose outcome will be reported through
    /// [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure). Rejections are counted.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        if inner.state != BreakerState::Open {
            return true;
        }

        let cooled_down = inner
            .last_failure
            .map_or(true, |at| now.saturating_duration_since(at) >= self.cfg.timeout());
        if cooled_down {
            inner.transition(BreakerState::HalfOpen);
            return true;
        }

        inner.rejected_calls += 1;
        tracing::debug!(rejected = inner.rejected_calls, "call rejected by open circuit breaker");
        false
    }

    pub fn record_success(&self) {
        self.record_success_at(Instant::now());
    }

    pub fn record_success_at(&self, now: Instant) {
        let mut inner = self.lock();
        inner.total_calls += 1;
        inner.successful_calls += 1;
        inner.success_count += 1;
        inner.last_success = Some(now);

        match inner.state {
            BreakerState::HalfOpen if inner.success_count >= self.cfg.success_threshold => {
                inner.transition(BreakerState::Closed);
            }
            BreakerState::Closed => inner.failure_count = 0,
            _ => {}
        }
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&self, now: Instant) {
        let mut inner = self.lock();
        inner.total_calls += 1;
        inner.failed_calls += 1;
        inner.failure_count += 1;
        inner.last_failure = Some(now);

        match inner.state {
            BreakerState::HalfOpen => inner.transition(BreakerState::Open),
            BreakerState::Closed if inner.failure_count >= self.cfg.failure_threshold => {
                inner.transition(BreakerState::Open);
            }
            _ => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn stats(&self) -> BreakerStats {
        self.stats_at(Instant::now())
    }

    pub fn stats_at(&self, now: Instant) -> BreakerStats {
        let inner = self.lock();
        let since = |at: Option<Instant>| {
            at.map(|at| now.saturating_duration_since(at).as_millis() as u64)
        };
        BreakerStats {
            state: inner.state,
            total_calls: inner.total_calls,
            successful_calls: inner.successful_calls,
            failed_calls: inner.failed_calls,
            rejected_calls: inner.rejected_calls,
            failure_count: inner.failure_count,
            success_rate: if inner.total_calls > 0 {
                inner.successful_calls as f64 / inner.total_calls as f64
            } else {
                0.0
            },
            since_last_failure_ms: since(inner.last_failure),
            since_last_success_ms: since(inner.last_success),
        }
    }

    /// Force the breaker closed and zero every counter.
    pub fn reset(&self) {
        let mut inner = self.lock();
        *inner = Inner::new();
        tracing::info!("circuit breaker reset");
    }
}
