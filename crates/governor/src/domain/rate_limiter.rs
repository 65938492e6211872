//! Per-client token-bucket rate limiting with load-adaptive quotas.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Rate limiter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitConfig {
    /// Requests admitted per client within one window at zero load.
    pub max_requests: u32,
    pub window_secs: u64,
    /// Minimum interval between sweeps of idle buckets.
    pub sweep_interval_secs: u64,
    /// Hard cap on tracked clients; exceeding it evicts the oldest half.
    pub max_buckets: usize,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window_secs: 60,
            sweep_interval_secs: 300,
            max_buckets: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
struct TokenBucket {
    /// Tokens spent in the current window.
    tokens: u32,
    last_refill: Instant,
    request_count: u64,
}

impl TokenBucket {
    fn new(now: Instant) -> Self {
        Self {
            tokens: 0,
            last_refill: now,
            request_count: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RateLimiterStats {
    pub total_keys: usize,
    /// Keys refilled within the last window.
    pub active_keys: usize,
    pub adaptive_factor: f64,
    pub effective_limit: u32,
    pub admitted: u64,
    pub rejected: u64,
    pub evicted: u64,
}

struct LimiterState {
    buckets: HashMap<String, TokenBucket>,
    adaptive_factor: f64,
    last_sweep: Instant,
    admitted: u64,
    rejected: u64,
    evicted: u64,
}

/// Lazily refilled token buckets keyed by client identifier.
///
/// There is no background timer: each bucket drains its spent tokens on
/// access in proportion to the time since its last refill.
pub struct TokenBucketLimiter {
    cfg: RateLimitConfig,
    state: Mutex<LimiterState>,
}

impl TokenBucketLimiter {
    pub fn new(cfg: RateLimitConfig) -> Self {
        Self::new_at(cfg, Instant::now())
    }

    pub fn new_at(cfg: RateLimitConfig, now: Instant) -> Self {
        Self {
            cfg,
            state: Mutex::new(LimiterState {
                buckets: HashMap::new(),
                adaptive_factor: 1.0,
                last_sweep: now,
                admitted: 0,
                rejected: 0,
                evicted: 0,
            }),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.cfg
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn effective_limit(&self, factor: f64) -> u32 {
        (f64::from(self.cfg.max_requests) * factor).floor() as u32
    }

    /// Drain spent tokens for the time elapsed since the last refill.
    fn refill(&self, bucket: &mut TokenBucket, now: Instant) {
        let window = self.cfg.window().as_secs_f64();
        if window <= 0.0 || self.cfg.max_requests == 0 {
            bucket.tokens = 0;
            bucket.last_refill = now;
            return;
        }

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        let per_token = window / f64::from(self.cfg.max_requests);
        let drained = (elapsed / per_token).floor();
        if drained < 1.0 {
            return;
        }

        if drained >= f64::from(bucket.tokens) {
            bucket.tokens = 0;
            bucket.last_refill = now;
        } else {
            // keep the fractional remainder for the next refill
            bucket.tokens -= drained as u32;
            bucket.last_refill += Duration::from_secs_f64(drained * per_token);
        }
    }

    /// Spend one token for `key` if its quota allows.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    /// Deterministic variant useful for testing.
    pub fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut state = self.lock();

        if now.saturating_duration_since(state.last_sweep) >= self.cfg.sweep_interval() {
            self.sweep_locked(&mut state, now);
        }

        let limit = self.effective_limit(state.adaptive_factor);
        if !state.buckets.contains_key(key) {
            state.buckets.insert(key.to_owned(), TokenBucket::new(now));
            if state.buckets.len() > self.cfg.max_buckets {
                self.sweep_locked(&mut state, now);
            }
        }

        let Some(mut bucket) = state.buckets.get(key).cloned() else {
            // evicted by the cap enforcement above; treat as a fresh bucket
            let mut fresh = TokenBucket::new(now);
            return self.admit(&mut state, key, &mut fresh, limit);
        };
        self.refill(&mut bucket, now);
        self.admit(&mut state, key, &mut bucket, limit)
    }

    fn admit(&self, state: &mut LimiterState, key: &str, bucket: &mut TokenBucket, limit: u32) -> bool {
        bucket.request_count += 1;
        let allowed = bucket.tokens < limit;
        if allowed {
            bucket.tokens += 1;
            state.admitted += 1;
        } else {
            state.rejected += 1;
            tracing::debug!(key, limit, requests = bucket.request_count, "rate limit exceeded");
        }
        state.buckets.insert(key.to_owned(), bucket.clone());
        allowed
    }

    /// Forget all state for `key`.
    pub fn reset(&self, key: &str) {
        self.lock().buckets.remove(key);
    }

    pub fn remaining_tokens(&self, key: &str) -> u32 {
        self.remaining_tokens_at(key, Instant::now())
    }

    pub fn remaining_tokens_at(&self, key: &str, now: Instant) -> u32 {
        let mut state = self.lock();
        let limit = self.effective_limit(state.adaptive_factor);
        let Some(bucket) = state.buckets.get_mut(key) else {
            return limit;
        };
        let mut refreshed = bucket.clone();
        self.refill(&mut refreshed, now);
        *bucket = refreshed;
        limit.saturating_sub(bucket.tokens)
    }

    /// Shrink every client's quota uniformly under system load.
    ///
    /// `load_factor` is clamped to `[0, 1]`; full load halves the quota.
    pub fn set_adaptive_throttling(&self, load_factor: f64) {
        debug_assert!(!load_factor.is_nan(), "load factor must be a number");
        let load = if load_factor.is_nan() {
            0.0
        } else {
            load_factor.clamp(0.0, 1.0)
        };
        let factor = 1.0 - load * 0.5;

        let mut state = self.lock();
        let previous = state.adaptive_factor;
        state.adaptive_factor = factor;
        let limit = self.effective_limit(factor);
        for bucket in state.buckets.values_mut() {
            bucket.tokens = bucket.tokens.min(limit);
        }

        if (previous - factor).abs() > f64::EPSILON {
            tracing::debug!(load, factor, effective_limit = limit, "adaptive throttling updated");
        }
    }

    pub fn adaptive_factor(&self) -> f64 {
        self.lock().adaptive_factor
    }

    pub fn stats(&self) -> RateLimiterStats {
        self.stats_at(Instant::now())
    }

    pub fn stats_at(&self, now: Instant) -> RateLimiterStats {
        let state = self.lock();
        let window = self.cfg.window();
        RateLimiterStats {
            total_keys: state.buckets.len(),
            active_keys: state
                .buckets
                .values()
                .filter(|b| now.saturating_duration_since(b.last_refill) < window)
                .count(),
            adaptive_factor: state.adaptive_factor,
            effective_limit: self.effective_limit(state.adaptive_factor),
            admitted: state.admitted,
            rejected: state.rejected,
            evicted: state.evicted,
        }
    }

    /// Drop idle buckets and enforce the bucket cap.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut state = self.lock();
        self.sweep_locked(&mut state, now)
    }

    fn sweep_locked(&self, state: &mut LimiterState, now: Instant) -> usize {
        state.last_sweep = now;
        let idle_after = self.cfg.window() * 2;
        let before = state.buckets.len();
        state
            .buckets
            .retain(|_, b| now.saturating_duration_since(b.last_refill) <= idle_after);
        let mut removed = before - state.buckets.len();

        if state.buckets.len() > self.cfg.max_buckets {
            let mut by_age: Vec<(Instant, String)> = state
                .buckets
                .iter()
                .map(|(k, b)| (b.last_refill, k.clone()))
                .collect();
            by_age.sort_unstable_by_key(|(last_refill, _)| *last_refill);
            let evict = by_age.len() / 2;
            for (_, key) in by_age.into_iter().take(evict) {
                state.buckets.remove(&key);
            }
            removed += evict;
            tracing::warn!(
                evicted = evict,
                max_buckets = self.cfg.max_buckets,
                "rate limiter bucket table over capacity, evicted oldest half"
            );
        }

        state.evicted += removed as u64;
        if removed > 0 {
            tracing::debug!(removed, remaining = state.buckets.len(), "rate limiter sweep");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    fn limiter(max_requests: u32, window_secs: u64) -> (TokenBucketLimiter, Instant) {
        let now = Instant::now();
        let cfg = RateLimitConfig {
            max_requests,
            window_secs,
            ..Default::default()
        };
        (TokenBucketLimiter::new_at(cfg, now), now)
    }

    #[test]
    fn throttled_limit_is_floored_without_a_minimum() {
        let (limiter, now) = limiter(3, 10);
        limiter.set_adaptive_throttling(1.0);
        assert_eq!(limiter.remaining_tokens_at("c1", now), 1);

        let (single, now) = self::limiter(1, 10);
        single.set_adaptive_throttling(1.0);
        assert_eq!(single.remaining_tokens_at("c1", now), 0);
        assert!(!single.allow_at("c1", now));
    }

    #[test]
    fn admits_up_to_limit_then_rejects() {
        let (limiter, now) = limiter(10, 10);
        for i in 0..10 {
            assert!(limiter.allow_at("c1", now), "request {i} should be admitted");
        }
        assert!(!limiter.allow_at("c1", now));
        assert_eq!(limiter.remaining_tokens_at("c1", now), 0);
    }

    #[test]
    fn refills_after_window() {
        let (limiter, now) = limiter(10, 10);
        for _ in 0..10 {
            limiter.allow_at("c1", now);
        }
        assert!(!limiter.allow_at("c1", now + Duration::from_secs(0)));

        let later = now + Duration::from_secs(10);
        for i in 0..10 {
            assert!(limiter.allow_at("c1", later), "request {i} after refill");
        }
        assert!(!limiter.allow_at("c1", later));
    }

    #[test]
    fn partial_refill_is_proportional() {
        let (limiter, now) = limiter(10, 10);
        for _ in 0..10 {
            limiter.allow_at("c1", now);
        }
        // one token per second
        let later = now + Duration::from_millis(3_500);
        assert_eq!(limiter.remaining_tokens_at("c1", later), 3);
        // the half second carried over completes a fourth token
        assert_eq!(limiter.remaining_tokens_at("c1", now + Duration::from_secs(4)), 4);
    }

    #[test]
    fn keys_are_independent() {
        let (limiter, now) = limiter(2, 10);
        assert!(limiter.allow_at("a", now));
        assert!(limiter.allow_at("a", now));
        assert!(!limiter.allow_at("a", now));
        assert!(limiter.allow_at("b", now));
    }

    #[test]
    fn full_load_halves_quota() {
        let (limiter, now) = limiter(10, 10);
        limiter.set_adaptive_throttling(1.0);
        let admitted = (0..20).filter(|_| limiter.allow_at("fresh", now)).count();
        assert_eq!(admitted, 5);
        assert_eq!(limiter.adaptive_factor(), 0.5);
    }

    #[test]
    fn load_factor_is_clamped() {
        let (limiter, _) = limiter(10, 10);
        limiter.set_adaptive_throttling(7.0);
        assert_eq!(limiter.adaptive_factor(), 0.5);
        limiter.set_adaptive_throttling(-1.0);
        assert_eq!(limiter.adaptive_factor(), 1.0);
    }

    #[test]
    fn throttling_clamps_spent_tokens() {
        let (limiter, now) = limiter(10, 10);
        for _ in 0..8 {
            limiter.allow_at("c1", now);
        }
        limiter.set_adaptive_throttling(1.0);
        assert_eq!(limiter.remaining_tokens_at("c1", now), 0);
        limiter.set_adaptive_throttling(0.0);
        assert_eq!(limiter.remaining_tokens_at("c1", now), 5);
    }

    #[test]
    fn reset_restores_full_quota() {
        let (limiter, now) = limiter(3, 10);
        for _ in 0..3 {
            limiter.allow_at("c1", now);
        }
        limiter.reset("c1");
        assert_eq!(limiter.remaining_tokens_at("c1", now), 3);
        assert!(limiter.allow_at("c1", now));
    }

    #[test]
    fn sweep_removes_idle_buckets() {
        let (limiter, now) = limiter(10, 10);
        limiter.allow_at("idle", now);
        limiter.allow_at("busy", now + Duration::from_secs(15));

        let removed = limiter.sweep_at(now + Duration::from_secs(21));
        assert_eq!(removed, 1);
        let stats = limiter.stats_at(now + Duration::from_secs(21));
        assert_eq!(stats.total_keys, 1);
        assert_eq!(stats.evicted, 1);
    }

    #[test]
    fn bucket_table_is_capped() {
        let now = Instant::now();
        let cfg = RateLimitConfig {
            max_requests: 10,
            window_secs: 60,
            max_buckets: 4,
            ..Default::default()
        };
        let limiter = TokenBucketLimiter::new_at(cfg, now);
        for i in 0..5u64 {
            limiter.allow_at(&format!("client-{i}"), now + Duration::from_millis(i));
        }

        let stats = limiter.stats_at(now);
        assert!(stats.total_keys <= 4, "table grew to {}", stats.total_keys);
        assert_eq!(limiter.remaining_tokens_at("client-0", now), 10, "oldest key evicted");
    }

    #[test]
    fn periodic_sweep_runs_inside_allow() {
        let (limiter, now) = limiter(10, 10);
        limiter.allow_at("old", now);
        limiter.allow_at("new", now + Duration::from_secs(301));
        assert_eq!(limiter.stats_at(now + Duration::from_secs(301)).total_keys, 1);
    }

    #[test]
    fn stats_count_admissions_and_rejections() {
        let (limiter, now) = limiter(1, 10);
        limiter.allow_at("a", now);
        limiter.allow_at("a", now);
        limiter.allow_at("b", now);

        let stats = limiter.stats_at(now);
        assert_eq!(stats.admitted, 2);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.active_keys, 2);
        assert_eq!(stats.effective_limit, 1);
    }
}
