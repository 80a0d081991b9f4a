use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::telemetry::metric_add;
use crate::types::RateLimitKey;

/// Retry hint returned by a limiter configured with a zero rate.
pub const DISABLED_RETRY_AFTER_SECS: u64 = 60;

/// Rate and burst for one limiter scope.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitConfig {
    /// Sustained refill rate. `0` denies every call.
    pub requests_per_second: f64,
    /// Bucket capacity.
    pub burst: u32,
    /// How long a bucket must have been full before the sweep removes it.
    pub idle_window_secs: u64,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            burst: 20,
            idle_window_secs: 0,
        }
    }
}

impl LimitConfig {
    pub fn per_second(n: u32) -> Self {
        Self {
            requests_per_second: f64::from(n),
            burst: n,
            idle_window_secs: 0,
        }
    }

    /// `n` requests per minute, with a burst of `n`.
    pub fn per_minute(n: u32) -> Self {
        Self {
            requests_per_second: f64::from(n) / 60.0,
            burst: n,
            idle_window_secs: 0,
        }
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = burst;
        self
    }

    pub fn with_idle_window(mut self, idle: Duration) -> Self {
        self.idle_window_secs = idle.as_secs();
        self
    }

    fn is_enabled(&self) -> bool {
        self.requests_per_second.is_finite() && self.requests_per_second > 0.0
    }
}

/// Token bucket state for a single key.
///
/// Refill is computed lazily from `last_refill` on every access.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub capacity: f64,
    pub tokens: f64,
    pub refill_per_sec: f64,
    pub last_refill_age_ms: u64,
}

impl TokenBucket {
    /// A full bucket. `refill_per_sec` must be positive.
    pub fn new(capacity: u32, refill_per_sec: f64, now: Instant) -> Self {
        let cap = f64::from(capacity.max(1));
        Self {
            capacity: cap,
            tokens: cap,
            refill_per_sec,
            last_refill: now,
        }
    }

    /// Take one token, or report how many whole seconds until one accrues.
    pub fn try_take(&mut self, now: Instant) -> Result<(), u64> {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let wait = ((1.0 - self.tokens) / self.refill_per_sec).ceil();
            Err((wait as u64).max(1))
        }
    }

    fn refill(&mut self, now: Instant) {
        self.tokens = self.available(now);
        self.last_refill = now;
    }

    /// Tokens available at `now`, without mutating the bucket.
    pub fn available(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.refill_per_sec).min(self.capacity)
    }

    /// Whether the bucket has been full for at least `idle`.
    ///
    /// The moment it became full is derived from the refill rate, so a bucket
    /// that was drained and fully recovered looks the same as one that was
    /// never touched.
    pub fn is_idle(&self, now: Instant, idle: Duration) -> bool {
        if self.available(now) < self.capacity {
            return false;
        }
        let to_full = (self.capacity - self.tokens).max(0.0) / self.refill_per_sec;
        let full_since = self.last_refill + Duration::from_secs_f64(to_full);
        now.saturating_duration_since(full_since) >= idle
    }

    pub fn snapshot(&self) -> RateLimiterStats {
        let now = Instant::now();
        let age = now.saturating_duration_since(self.last_refill).as_millis() as u64;
        RateLimiterStats {
            capacity: self.capacity,
            tokens: self.available(now),
            refill_per_sec: self.refill_per_sec,
            last_refill_age_ms: age,
        }
    }
}

/// Keyed token-bucket limiter.
///
/// Buckets are created on first use and live in a sharded concurrent map,
/// so unrelated keys never contend on one lock. Each bucket is mutated
/// while its shard entry is held, which also serializes it against the
/// sweep.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    config: LimitConfig,
    buckets: DashMap<RateLimitKey, TokenBucket>,
}

impl TokenBucketLimiter {
    pub fn new(config: LimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    pub fn config(&self) -> &LimitConfig {
        &self.config
    }

    pub fn allow(&self, key: &RateLimitKey) -> bool {
        self.allow_or_reason(key).0
    }

    /// Returns whether the call is allowed and, if not, the retry hint in
    /// seconds.
    ///
    /// An empty key always denies with no hint: falling back to a shared
    /// bucket would let distinct anonymous callers starve each other.
    pub fn allow_or_reason(&self, key: &RateLimitKey) -> (bool, u64) {
        if key.is_empty() {
            return (false, 0);
        }
        if !self.config.is_enabled() {
            return (false, DISABLED_RETRY_AFTER_SECS);
        }

        let now = Instant::now();
        let result = match self.buckets.get_mut(key) {
            Some(mut bucket) => bucket.try_take(now),
            None => self
                .buckets
                .entry(key.clone())
                .or_insert_with(|| {
                    TokenBucket::new(self.config.burst, self.config.requests_per_second, now)
                })
                .try_take(now),
        };

        match result {
            Ok(()) => (true, 0),
            Err(retry_after) => (false, retry_after),
        }
    }

    /// Remove buckets that have been full for the configured idle window.
    ///
    /// Candidates are found under shard read locks, then each is removed
    /// only if it is still idle under its entry lock. A bucket that
    /// [`allow`](Self::allow) touched in between survives, and an evicted
    /// key is recreated full on its next use.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let idle = Duration::from_secs(self.config.idle_window_secs);

        let candidates = self.idle_keys(now, idle);
        let removed = self.remove_idle(candidates, now, idle);

        metric_add("relay.limiter.swept", removed as u64);
        removed
    }

    fn idle_keys(&self, now: Instant, idle: Duration) -> Vec<RateLimitKey> {
        self.buckets
            .iter()
            .filter(|entry| entry.value().is_idle(now, idle))
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn remove_idle(&self, keys: Vec<RateLimitKey>, now: Instant, idle: Duration) -> usize {
        keys.into_iter()
            .filter(|key| {
                self.buckets
                    .remove_if(key, |_, bucket| bucket.is_idle(now, idle))
                    .is_some()
            })
            .count()
    }

    pub fn stats(&self, key: &RateLimitKey) -> Option<RateLimiterStats> {
        self.buckets.get(key).map(|bucket| bucket.snapshot())
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_hint_is_time_to_next_token() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(1, 0.5, now);
        assert!(bucket.try_take(now).is_ok());
        assert_eq!(bucket.try_take(now), Err(2));
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let now = Instant::now();
        let bucket = TokenBucket::new(3, 100.0, now);
        assert_eq!(bucket.available(now + Duration::from_secs(60)), 3.0);
    }

    #[test]
    fn zero_capacity_is_promoted_to_one() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(0, 1.0, now);
        assert!(bucket.try_take(now).is_ok());
        assert!(bucket.try_take(now).is_err());
    }

    #[test]
    fn drained_bucket_is_not_idle() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(2, 1.0, now);
        bucket.try_take(now).unwrap();
        assert!(!bucket.is_idle(now, Duration::ZERO));
        // Back to full one second later.
        assert!(bucket.is_idle(now + Duration::from_secs(1), Duration::ZERO));
        assert!(!bucket.is_idle(now + Duration::from_secs(1), Duration::from_secs(5)));
        assert!(bucket.is_idle(now + Duration::from_secs(6), Duration::from_secs(5)));
    }

    #[test]
    fn per_minute_config() {
        let config = LimitConfig::per_minute(120);
        assert_eq!(config.burst, 120);
        assert_eq!(config.requests_per_second, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_used_after_scan_survives_removal() {
        let limiter = TokenBucketLimiter::new(LimitConfig {
            requests_per_second: 1.0,
            burst: 2,
            idle_window_secs: 0,
        });
        let key = RateLimitKey::new("late");
        limiter.allow(&key);
        tokio::time::advance(Duration::from_secs(2)).await;

        let now = Instant::now();
        let idle = Duration::ZERO;
        let candidates = limiter.idle_keys(now, idle);
        assert_eq!(candidates, vec![key.clone()]);

        assert!(limiter.allow(&key));
        assert_eq!(limiter.remove_idle(candidates, now, idle), 0);
        assert!(limiter.stats(&key).is_some());
    }
}
