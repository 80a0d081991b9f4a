//! Decision and outcome signals.
//!
//! Components publish [`PipelineEvent`]s into an [`EventBus`]. Emitting never
//! blocks: events go into a bounded channel and are handed to observers on a
//! separate task. When the channel is full the event is dropped and counted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::breaker::CircuitState;
use crate::error::{FailureClass, PublishError};
use crate::telemetry::metric_inc;
use crate::types::{DeliveryAttempt, DeliveryId, Scope};

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Admitted,
    AdmissionDenied {
        scope: Scope,
        retry_after_secs: u64,
    },
    CircuitTransition {
        from: CircuitState,
        to: CircuitState,
    },
    Delivered {
        id: DeliveryId,
        attempts: u32,
    },
    /// A retryable attempt failed. `retry_in` is `None` when attempts are
    /// exhausted.
    RetryableFailure {
        attempt: DeliveryAttempt,
        retry_in: Option<Duration>,
    },
    TerminalFailure {
        class: FailureClass,
        attempts: u32,
    },
    DeadLettered {
        id: DeliveryId,
        reason: FailureClass,
        retry_count: u32,
    },
    DeadLetterFailed {
        reason: FailureClass,
        error: PublishError,
    },
    Cancelled {
        attempts: u32,
    },
}

/// Subscriber to pipeline events.
///
/// Runs on the event-bus task, never on a request path.
pub trait Observer: Send + Sync {
    fn on_event(&self, event: &PipelineEvent);
}

impl<F> Observer for F
where
    F: Fn(&PipelineEvent) + Send + Sync,
{
    fn on_event(&self, event: &PipelineEvent) {
        self(event)
    }
}

/// Cheap, cloneable handle for emitting events.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    tx: Option<mpsc::Sender<PipelineEvent>>,
}

impl EventBus {
    /// A bus that discards every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Start the dispatch task. It runs until `shutdown` is cancelled (after
    /// draining what is already queued) or every handle has been dropped.
    pub fn spawn(
        observers: Vec<Arc<dyn Observer>>,
        capacity: usize,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<PipelineEvent>(capacity.max(1));

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => dispatch(&observers, &event),
                        None => break,
                    },
                    _ = shutdown.cancelled() => {
                        rx.close();
                        while let Ok(event) = rx.try_recv() {
                            dispatch(&observers, &event);
                        }
                        break;
                    }
                }
            }
        });

        (Self { tx: Some(tx) }, handle)
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn emit(&self, event: PipelineEvent) {
        let Some(tx) = &self.tx else { return };
        if tx.try_send(event).is_err() {
            metric_inc("relay.events.dropped");
        }
    }
}

fn dispatch(observers: &[Arc<dyn Observer>], event: &PipelineEvent) {
    for observer in observers {
        observer.on_event(event);
    }
}

/// Writes every event to the `tracing` log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TelemetryObserver;

#[cfg(feature = "tracing")]
impl Observer for TelemetryObserver {
    fn on_event(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::Admitted => {
                tracing::trace!(target: "relay::admission", "admitted");
            }
            PipelineEvent::AdmissionDenied { scope, retry_after_secs } => {
                tracing::debug!(
                    target: "relay::admission",
                    scope = %scope,
                    retry_after_secs,
                    "admission denied"
                );
            }
            PipelineEvent::CircuitTransition { from, to } => {
                if *to == CircuitState::Open {
                    tracing::warn!(target: "relay::breaker", from = %from, to = %to, "circuit transition");
                } else {
                    tracing::info!(target: "relay::breaker", from = %from, to = %to, "circuit transition");
                }
            }
            PipelineEvent::Delivered { id, attempts } => {
                tracing::debug!(target: "relay::delivery", id = %id, attempts, "delivered");
            }
            PipelineEvent::RetryableFailure { attempt, retry_in } => {
                let class = attempt.result.as_ref().err().map(|c| c.as_str()).unwrap_or("none");
                tracing::info!(
                    target: "relay::delivery",
                    event_id = %attempt.event.id.0,
                    attempt = attempt.attempt,
                    class,
                    elapsed_ms = attempt.elapsed.as_millis() as u64,
                    retry_in_ms = retry_in.map(|d| d.as_millis() as u64),
                    "attempt failed"
                );
            }
            PipelineEvent::TerminalFailure { class, attempts } => {
                tracing::warn!(target: "relay::delivery", class = %class, attempts, "terminal failure");
            }
            PipelineEvent::DeadLettered { id, reason, retry_count } => {
                tracing::warn!(
                    target: "relay::dlq",
                    id = %id,
                    reason = %reason,
                    retry_count,
                    "event dead-lettered"
                );
            }
            PipelineEvent::DeadLetterFailed { reason, error } => {
                tracing::error!(
                    target: "relay::dlq",
                    reason = %reason,
                    error = %error,
                    "dead-letter diversion failed"
                );
            }
            PipelineEvent::Cancelled { attempts } => {
                tracing::debug!(target: "relay::delivery", attempts, "delivery cancelled");
            }
        }
    }
}

#[cfg(not(feature = "tracing"))]
impl Observer for TelemetryObserver {
    fn on_event(&self, _event: &PipelineEvent) {}
}
