use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Wait between delivery attempts.
///
/// The orchestrator only asks for a delay; the curve is up to the
/// implementation.
pub trait Backoff: Send + Sync {
    /// Delay after `attempt` failed attempts (1-based).
    fn delay(&self, attempt: u32) -> Duration;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    Fixed {
        delay_ms: u64,
    },
    /// `base_ms * 2^(attempt-1)`, capped at `max_ms`, plus up to `jitter_ms`.
    Exponential {
        base_ms: u64,
        max_ms: u64,
        jitter_ms: u64,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base_ms: 100,
            max_ms: 5_000,
            jitter_ms: 50,
        }
    }
}

impl Backoff for BackoffPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            BackoffPolicy::Exponential {
                base_ms,
                max_ms,
                jitter_ms,
            } => {
                let base = base_ms.max(1);
                let max = max_ms.max(base);
                let pow = 2u64.saturating_pow(attempt.saturating_sub(1));
                let exp = base.saturating_mul(pow);
                Duration::from_millis(exp.min(max)) + jitter_delay(jitter_ms)
            }
        }
    }
}

fn jitter_delay(jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(fastrand::u64(0..=jitter_ms))
}
