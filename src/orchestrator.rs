//! Retry and dead-letter orchestration around the guarded publisher.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::{Backoff, BackoffPolicy};
use crate::breaker::CircuitBreaker;
use crate::error::{DeadLetterStatus, DeliveryError, FailureClass, PublishError};
use crate::observer::{EventBus, PipelineEvent};
use crate::publisher::{DeadLetterSink, Publisher};
use crate::telemetry::{metric_inc, metric_inc_labeled};
use crate::types::{now_secs, DeadLetterRecord, DeliveryAttempt, DeliveryId, Event};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Attempts per event, including the first.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Upper bound on a single publish. `None` waits indefinitely.
    pub attempt_timeout_ms: Option<u64>,
    pub dead_letter_enabled: bool,
    /// Also divert non-retryable failures.
    pub dead_letter_terminal: bool,
    pub dead_letter_timeout_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            attempt_timeout_ms: Some(10_000),
            dead_letter_enabled: true,
            dead_letter_terminal: false,
            dead_letter_timeout_ms: 5_000,
        }
    }
}

impl DeliveryConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn with_dead_letter(mut self, enabled: bool) -> Self {
        self.dead_letter_enabled = enabled;
        self
    }

    pub fn with_dead_letter_terminal(mut self, enabled: bool) -> Self {
        self.dead_letter_terminal = enabled;
        self
    }

    fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    fn dead_letter_timeout(&self) -> Duration {
        Duration::from_millis(self.dead_letter_timeout_ms)
    }
}

/// Drives one event from first attempt to success, terminal failure, or
/// dead-letter diversion.
///
/// Holds shared references to the breaker and collaborators; it never
/// touches their internals.
pub struct DeliveryOrchestrator {
    config: DeliveryConfig,
    publisher: Arc<dyn Publisher>,
    breaker: Arc<CircuitBreaker>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    backoff: Arc<dyn Backoff>,
    events: EventBus,
}

impl DeliveryOrchestrator {
    pub fn new(
        config: DeliveryConfig,
        publisher: Arc<dyn Publisher>,
        breaker: Arc<CircuitBreaker>,
        dead_letter: Option<Arc<dyn DeadLetterSink>>,
        events: EventBus,
    ) -> Self {
        let backoff: Arc<dyn Backoff> = Arc::new(config.backoff.clone());
        Self {
            config,
            publisher,
            breaker,
            dead_letter,
            backoff,
            events,
        }
    }

    /// Replace the configured backoff curve.
    pub fn with_backoff(mut self, backoff: Arc<dyn Backoff>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Publish `event`, retrying retryable failures up to `max_attempts`
    /// (at least one attempt is always made).
    ///
    /// On failure the returned error carries the last publisher error, even
    /// if dead-letter diversion also failed. Cancelling `ctx` aborts an
    /// in-flight attempt or backoff and returns a `cancelled` error without
    /// diverting. A failure that was already observed is still diverted.
    pub async fn deliver(
        &self,
        ctx: &CancellationToken,
        event: Event,
        max_attempts: u32,
    ) -> Result<DeliveryId, DeliveryError> {
        let max_attempts = max_attempts.max(1);
        let event = Arc::new(event);
        let started = Instant::now();
        let first_attempt_secs = now_secs();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let error = match self.attempt(ctx, &event).await {
                Ok(id) => {
                    metric_inc("relay.delivery.success");
                    self.events.emit(PipelineEvent::Delivered {
                        id: id.clone(),
                        attempts: attempt,
                    });
                    return Ok(id);
                }
                Err(error) => error,
            };

            if error.class == FailureClass::Cancelled {
                return Err(self.cancelled(attempt));
            }

            let exhausted = attempt >= max_attempts;

            if !error.is_retryable() {
                metric_inc_labeled("relay.delivery.failed", "class", error.class.as_str());
                self.events.emit(PipelineEvent::TerminalFailure {
                    class: error.class,
                    attempts: attempt,
                });
                let dead_letter = if self.config.dead_letter_terminal {
                    self.divert(&event, &error, attempt, first_attempt_secs)
                        .await
                } else {
                    DeadLetterStatus::NotDiverted
                };
                return Err(DeliveryError {
                    last_error: error,
                    attempts: attempt,
                    dead_letter,
                });
            }

            let retry_in = (!exhausted).then(|| self.backoff.delay(attempt));
            metric_inc_labeled("relay.delivery.retry", "class", error.class.as_str());
            self.events.emit(PipelineEvent::RetryableFailure {
                attempt: DeliveryAttempt {
                    event: Arc::clone(&event),
                    attempt,
                    elapsed: started.elapsed(),
                    result: Err(error.class),
                },
                retry_in,
            });

            let Some(delay) = retry_in else {
                metric_inc_labeled("relay.delivery.failed", "class", error.class.as_str());
                let dead_letter = self
                    .divert(&event, &error, attempt, first_attempt_secs)
                    .await;
                return Err(DeliveryError {
                    last_error: error,
                    attempts: attempt,
                    dead_letter,
                });
            };

            tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(self.cancelled(attempt)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Deliver a dead-lettered event again with the configured attempt
    /// budget.
    pub async fn replay(
        &self,
        ctx: &CancellationToken,
        record: &DeadLetterRecord,
    ) -> Result<DeliveryId, DeliveryError> {
        self.deliver(ctx, record.to_event(), self.config.max_attempts)
            .await
    }

    async fn attempt(
        &self,
        ctx: &CancellationToken,
        event: &Event,
    ) -> Result<DeliveryId, PublishError> {
        let publish = move || async move {
            let call = self.publisher.publish(&event.payload, &event.attributes);
            match self.config.attempt_timeout() {
                Some(limit) => tokio::time::timeout(limit, call)
                    .await
                    .unwrap_or_else(|_| Err(PublishError::timed_out())),
                None => call.await,
            }
        };

        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(PublishError::cancelled()),
            result = self.breaker.call(publish) => result,
        }
    }

    /// Hand a failed event to the dead-letter sink.
    ///
    /// Only the dead-letter timeout bounds this call: once an attempt has
    /// failed for real the record is written even if the caller has gone.
    async fn divert(
        &self,
        event: &Event,
        error: &PublishError,
        attempts: u32,
        first_attempt_secs: u64,
    ) -> DeadLetterStatus {
        if !self.config.dead_letter_enabled {
            return DeadLetterStatus::NotDiverted;
        }
        let Some(sink) = &self.dead_letter else {
            return DeadLetterStatus::NotDiverted;
        };

        let record = DeadLetterRecord {
            event_id: event.id.clone(),
            payload: event.payload.clone(),
            attributes: event.attributes.clone(),
            failure_reason: error.class,
            retry_count: attempts,
            first_attempt_secs,
            dead_lettered_at_secs: now_secs(),
            last_error_message: error.message.clone(),
        };

        let result = tokio::time::timeout(self.config.dead_letter_timeout(), sink.divert(&record))
            .await
            .unwrap_or_else(|_| Err(PublishError::timed_out()));

        match result {
            Ok(id) => {
                metric_inc_labeled("relay.dlq.diverted", "reason", error.class.as_str());
                self.events.emit(PipelineEvent::DeadLettered {
                    id: id.clone(),
                    reason: error.class,
                    retry_count: attempts,
                });
                DeadLetterStatus::Diverted(id)
            }
            Err(dlq_error) => {
                metric_inc("relay.dlq.failed");
                #[cfg(feature = "tracing")]
                tracing::error!(
                    target: "relay::dlq",
                    event_id = %event.id.0,
                    reason = %error.class,
                    error = %dlq_error,
                    "dead-letter diversion failed"
                );
                self.events.emit(PipelineEvent::DeadLetterFailed {
                    reason: error.class,
                    error: dlq_error,
                });
                DeadLetterStatus::Failed
            }
        }
    }

    fn cancelled(&self, attempts: u32) -> DeliveryError {
        metric_inc_labeled("relay.delivery.failed", "class", FailureClass::Cancelled.as_str());
        self.events.emit(PipelineEvent::Cancelled { attempts });
        DeliveryError {
            last_error: PublishError::cancelled(),
            attempts,
            dead_letter: DeadLetterStatus::NotDiverted,
        }
    }
}
