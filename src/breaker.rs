//! Circuit breaker guarding the downstream publisher.
//!
//! One breaker protects one dependency. Its counters sit behind a single
//! lock that is held only to decide admission or record an outcome, never
//! across the wrapped call.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::PublishError;
use crate::observer::{EventBus, PipelineEvent};
use crate::telemetry::{metric_inc, metric_inc_labeled};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    #[default]
    Closed,
    /// Calls fail fast without reaching the downstream.
    Open,
    /// A bounded number of probe calls pass through.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed before opening.
    pub failure_threshold: u32,
    /// Consecutive probe successes in HalfOpen before closing.
    pub success_threshold: u32,
    /// Time spent Open before probing.
    pub timeout_ms: u64,
    /// Concurrent probes allowed in HalfOpen.
    pub max_half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 30_000,
            max_half_open_requests: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_half_open_requests(mut self, max: u32) -> Self {
        self.max_half_open_requests = max;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Point-in-time view of the breaker's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub half_open_in_flight: u32,
    pub since_last_failure: Option<Duration>,
    pub since_last_transition: Duration,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    half_open_in_flight: u32,
    last_failure_time: Option<Instant>,
    last_transition_time: Instant,
    /// Bumped on every transition. Outcomes of calls admitted under an
    /// older generation are not counted.
    generation: u64,
}

type Transition = (CircuitState, CircuitState);

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    events: EventBus,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, events: EventBus) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                half_open_in_flight: 0,
                last_failure_time: None,
                last_transition_time: Instant::now(),
                generation: 0,
            }),
            events,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Stored state. An Open breaker whose timeout has elapsed reports Open
    /// until the next call moves it to HalfOpen.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            half_open_in_flight: inner.half_open_in_flight,
            since_last_failure: inner
                .last_failure_time
                .map(|t| now.saturating_duration_since(t)),
            since_last_transition: now.saturating_duration_since(inner.last_transition_time),
        }
    }

    /// Force the breaker Closed and clear its counters.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            let transition = if inner.state != CircuitState::Closed {
                Some(self.transition(&mut inner, CircuitState::Closed, Instant::now()))
            } else {
                None
            };
            inner.consecutive_failures = 0;
            inner.consecutive_successes = 0;
            transition
        };
        self.notify(transition);
    }

    /// Run `call` if the breaker admits it.
    ///
    /// A refused call returns [`PublishError::circuit_open`] without invoking
    /// `call`. Retryable errors count as failures, `Ok` as success; other
    /// classifications leave the counters untouched. If the returned future
    /// is dropped mid-call the probe slot is released without recording.
    pub async fn call<F, Fut, T>(&self, call: F) -> Result<T, PublishError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PublishError>>,
    {
        let permit = self.acquire()?;
        let result = call().await;

        match &result {
            Ok(_) => permit.succeeded(),
            Err(err) if err.is_retryable() => permit.failed(),
            Err(_) => drop(permit),
        }

        result
    }

    fn acquire(&self) -> Result<Permit<'_>, PublishError> {
        let now = Instant::now();
        let (admitted, transition) = {
            let mut inner = self.inner.lock();
            let mut transition = None;

            if inner.state == CircuitState::Open
                && now.saturating_duration_since(inner.last_transition_time)
                    >= self.config.timeout()
            {
                transition = Some(self.transition(&mut inner, CircuitState::HalfOpen, now));
            }

            let admitted = match inner.state {
                CircuitState::Closed => Some((inner.generation, false)),
                CircuitState::Open => None,
                CircuitState::HalfOpen => {
                    if inner.half_open_in_flight < self.config.max_half_open_requests {
                        inner.half_open_in_flight += 1;
                        Some((inner.generation, true))
                    } else {
                        None
                    }
                }
            };

            (admitted, transition)
        };

        self.notify(transition);

        match admitted {
            Some((generation, half_open)) => Ok(Permit {
                breaker: self,
                generation,
                half_open,
                settled: false,
            }),
            None => {
                metric_inc("relay.breaker.rejected");
                Err(PublishError::circuit_open())
            }
        }
    }

    fn on_success(&self, generation: u64, half_open: bool) {
        let transition = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            if half_open {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            }
            inner.consecutive_failures = 0;
            inner.consecutive_successes = inner.consecutive_successes.saturating_add(1);

            if inner.state == CircuitState::HalfOpen
                && inner.consecutive_successes >= self.config.success_threshold
            {
                Some(self.transition(&mut inner, CircuitState::Closed, Instant::now()))
            } else {
                None
            }
        };
        self.notify(transition);
    }

    fn on_failure(&self, generation: u64, half_open: bool) {
        let now = Instant::now();
        let transition = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            if half_open {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            }
            inner.last_failure_time = Some(now);
            inner.consecutive_successes = 0;
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

            match inner.state {
                CircuitState::Closed
                    if inner.consecutive_failures >= self.config.failure_threshold =>
                {
                    Some(self.transition(&mut inner, CircuitState::Open, now))
                }
                CircuitState::HalfOpen => {
                    Some(self.transition(&mut inner, CircuitState::Open, now))
                }
                _ => None,
            }
        };
        self.notify(transition);
    }

    fn on_release(&self, generation: u64, half_open: bool) {
        if !half_open {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState, now: Instant) -> Transition {
        let from = inner.state;
        inner.state = to;
        inner.last_transition_time = now;
        inner.generation = inner.generation.wrapping_add(1);
        inner.half_open_in_flight = 0;

        match to {
            CircuitState::Open | CircuitState::HalfOpen => inner.consecutive_successes = 0,
            CircuitState::Closed => inner.consecutive_failures = 0,
        }

        (from, to)
    }

    fn notify(&self, transition: Option<Transition>) {
        let Some((from, to)) = transition else { return };
        metric_inc_labeled("relay.breaker.transition", "to", to.as_str());
        self.events.emit(PipelineEvent::CircuitTransition { from, to });
    }
}

/// Admission ticket for one call. Settled exactly once; dropping it
/// unsettled gives back a half-open slot.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    half_open: bool,
    settled: bool,
}

impl Permit<'_> {
    fn succeeded(mut self) {
        self.settled = true;
        self.breaker.on_success(self.generation, self.half_open);
    }

    fn failed(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.generation, self.half_open);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_release(self.generation, self.half_open);
        }
    }
}
