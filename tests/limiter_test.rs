use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use webhook_relay::{LimitConfig, RateLimitKey, TokenBucketLimiter, DISABLED_RETRY_AFTER_SECS};

fn limiter(rps: f64, burst: u32) -> TokenBucketLimiter {
    TokenBucketLimiter::new(LimitConfig {
        requests_per_second: rps,
        burst,
        idle_window_secs: 0,
    })
}

#[tokio::test(start_paused = true)]
async fn test_burst_bound_holds() {
    let limiter = limiter(1.0, 5);
    let key = RateLimitKey::new("203.0.113.7");

    for _ in 0..5 {
        assert!(limiter.allow(&key));
    }
    assert_eq!(limiter.allow_or_reason(&key), (false, 1));
}

#[tokio::test(start_paused = true)]
async fn test_tokens_refill_over_time() {
    let limiter = limiter(2.0, 2);
    let key = RateLimitKey::new("client");

    assert!(limiter.allow(&key));
    assert!(limiter.allow(&key));
    assert!(!limiter.allow(&key));

    tokio::time::advance(Duration::from_millis(500)).await;
    assert!(limiter.allow(&key));
    assert!(!limiter.allow(&key));
}

#[tokio::test(start_paused = true)]
async fn test_keys_are_independent() {
    let limiter = limiter(1.0, 2);
    let a = RateLimitKey::new("a");
    let b = RateLimitKey::new("b");

    while limiter.allow(&a) {}
    assert!(limiter.allow(&b));
    assert!(limiter.allow(&b));
    assert_eq!(limiter.len(), 2);
}

#[tokio::test]
async fn test_empty_key_and_zero_rate_deny() {
    let open = limiter(10.0, 10);
    assert_eq!(open.allow_or_reason(&RateLimitKey::new("")), (false, 0));
    assert!(open.is_empty());

    let closed = limiter(0.0, 10);
    assert_eq!(
        closed.allow_or_reason(&RateLimitKey::new("anyone")),
        (false, DISABLED_RETRY_AFTER_SECS)
    );
}

#[tokio::test(start_paused = true)]
async fn test_sweep_removes_only_full_buckets() {
    let limiter = limiter(1.0, 5);
    let drained = RateLimitKey::new("drained");
    let touched = RateLimitKey::new("touched");

    for _ in 0..5 {
        limiter.allow(&drained);
    }
    limiter.allow(&touched);
    assert_eq!(limiter.cleanup_expired(), 0);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(limiter.cleanup_expired(), 1);
    assert!(limiter.stats(&touched).is_none());
    assert!(limiter.stats(&drained).is_some());

    // A swept key starts again with a full burst.
    for _ in 0..5 {
        assert!(limiter.allow(&touched));
    }
}

#[tokio::test(start_paused = true)]
async fn test_idle_window_delays_eviction() {
    let limiter = TokenBucketLimiter::new(
        LimitConfig::per_second(10).with_idle_window(Duration::from_secs(60)),
    );
    let key = RateLimitKey::new("k");
    limiter.allow(&key);

    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(limiter.cleanup_expired(), 0);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(limiter.cleanup_expired(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_checks_never_exceed_budget() {
    const PER_MINUTE: u32 = 50;
    let limiter = Arc::new(TokenBucketLimiter::new(LimitConfig::per_minute(PER_MINUTE)));
    let allowed = Arc::new(AtomicU32::new(0));

    let handles: Vec<_> = (0..1_000)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            let allowed = Arc::clone(&allowed);
            tokio::spawn(async move {
                if limiter.allow(&RateLimitKey::new("shared")) {
                    allowed.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap();
    }

    let allowed = allowed.load(Ordering::SeqCst);
    // One extra token accrues every 1.2s; allow for slow CI.
    assert!(allowed >= PER_MINUTE);
    assert!(allowed <= PER_MINUTE + 2, "admitted {allowed}");
}
