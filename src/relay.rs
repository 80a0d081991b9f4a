use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::admission::{
    AdmissionController, AdmissionDecision, HeaderKeyExtractor, InboundRequest, KeyExtractor,
};
use crate::breaker::CircuitBreaker;
use crate::config::RelayConfig;
use crate::error::{DeliveryError, Disposition};
use crate::observer::{EventBus, Observer};
use crate::orchestrator::DeliveryOrchestrator;
use crate::publisher::{DeadLetterSink, Publisher};
use crate::types::{DeadLetterRecord, DeliveryId, Event, Scope};

#[cfg(feature = "tracing")]
fn trace_event(message: &'static str) {
    tracing::info!(target: "relay", "{}", message);
}

#[cfg(not(feature = "tracing"))]
fn trace_event(_message: &'static str) {}

/// Result of [`Relay::handle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered(DeliveryId),
    Denied { scope: Scope, retry_after_secs: u64 },
    Failed(DeliveryError),
    /// [`Relay::shutdown`] has been called; nothing was attempted.
    ShuttingDown,
}

impl RelayOutcome {
    pub fn disposition(&self) -> Disposition {
        match self {
            RelayOutcome::Delivered(_) => Disposition::Accepted,
            RelayOutcome::Denied {
                retry_after_secs, ..
            } => Disposition::RetryLater {
                retry_after_secs: *retry_after_secs,
            },
            RelayOutcome::Failed(err) => err.disposition(),
            RelayOutcome::ShuttingDown => Disposition::RetryLater {
                retry_after_secs: 0,
            },
        }
    }
}

/// Owns one admission controller, one circuit breaker and one delivery
/// orchestrator, plus the background tasks they need.
///
/// Nothing here is global: build as many relays as there are downstreams.
pub struct Relay {
    config: RelayConfig,
    admission: Arc<AdmissionController>,
    breaker: Arc<CircuitBreaker>,
    orchestrator: DeliveryOrchestrator,
    is_running: AtomicBool,
    shutdown: CancellationToken,
    sweeper_handle: Option<JoinHandle<()>>,
    events_handle: Option<JoinHandle<()>>,
}

impl Relay {
    /// Must be called inside a Tokio runtime. `extractor` defaults to a
    /// [`HeaderKeyExtractor`] built from `config.admission`.
    pub fn new(
        config: RelayConfig,
        publisher: Arc<dyn Publisher>,
        dead_letter: Option<Arc<dyn DeadLetterSink>>,
        extractor: Option<Arc<dyn KeyExtractor>>,
        observers: Vec<Arc<dyn Observer>>,
    ) -> Self {
        let shutdown = CancellationToken::new();

        let (events, events_handle) = if observers.is_empty() || config.event_buffer == 0 {
            (EventBus::disabled(), None)
        } else {
            let (bus, handle) =
                EventBus::spawn(observers, config.event_buffer, shutdown.child_token());
            (bus, Some(handle))
        };

        let extractor: Arc<dyn KeyExtractor> = match extractor {
            Some(extractor) => extractor,
            None => Arc::new(HeaderKeyExtractor::new(&config.admission)),
        };
        let admission = Arc::new(AdmissionController::with_extractor(
            &config.admission,
            extractor,
            events.clone(),
        ));

        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone(), events.clone()));
        let orchestrator = DeliveryOrchestrator::new(
            config.delivery.clone(),
            publisher,
            Arc::clone(&breaker),
            dead_letter,
            events,
        );

        let sweeper_handle = config.sweep_interval().map(|period| {
            Arc::clone(&admission).spawn_sweeper(period, shutdown.child_token())
        });

        trace_event("relay started");

        Self {
            config,
            admission,
            breaker,
            orchestrator,
            is_running: AtomicBool::new(true),
            shutdown,
            sweeper_handle,
            events_handle,
        }
    }

    /// Admit `request`, then deliver `event` downstream.
    ///
    /// Denied requests never reach the breaker or the publisher.
    pub async fn handle(
        &self,
        ctx: &CancellationToken,
        request: &InboundRequest,
        event: Event,
    ) -> RelayOutcome {
        if !self.is_running() {
            return RelayOutcome::ShuttingDown;
        }

        if let AdmissionDecision::Denied {
            scope,
            retry_after_secs,
        } = self.admission.admit(request)
        {
            return RelayOutcome::Denied {
                scope,
                retry_after_secs,
            };
        }

        match self
            .orchestrator
            .deliver(ctx, event, self.config.delivery.max_attempts)
            .await
        {
            Ok(id) => RelayOutcome::Delivered(id),
            Err(err) => RelayOutcome::Failed(err),
        }
    }

    /// Redeliver a dead-lettered record, bypassing admission.
    pub async fn replay(
        &self,
        ctx: &CancellationToken,
        record: &DeadLetterRecord,
    ) -> Result<DeliveryId, DeliveryError> {
        self.orchestrator.replay(ctx, record).await
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn orchestrator(&self) -> &DeliveryOrchestrator {
        &self.orchestrator
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Stop accepting requests, stop the sweeper, and flush pending
    /// observer events. In-flight deliveries are left to their callers.
    pub async fn shutdown(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.shutdown.cancel();

        if let Some(handle) = self.sweeper_handle.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.events_handle.take() {
            let _ = handle.await;
        }

        trace_event("relay stopped");
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
