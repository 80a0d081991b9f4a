mod common;

use std::sync::Arc;

use common::{channel_observer, event, ScriptedPublisher};
use tokio_util::sync::CancellationToken;
use webhook_relay::{
    BackoffPolicy, CircuitBreakerConfig, Disposition, InMemoryDeadLetterSink, InboundRequest,
    LimitConfig, PipelineEvent, PublishError, Relay, RelayConfig, RelayOutcome, Scope,
};

fn config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.delivery.backoff = BackoffPolicy::Fixed { delay_ms: 1 };
    config
}

fn request() -> InboundRequest {
    InboundRequest::new(None).with_header("X-Forwarded-For", "198.51.100.23")
}

#[tokio::test]
async fn test_admitted_request_is_delivered() {
    let publisher = ScriptedPublisher::ok();
    let mut relay = Relay::new(config(), publisher.clone(), None, None, Vec::new());

    let outcome = relay
        .handle(&CancellationToken::new(), &request(), event(1))
        .await;

    assert!(matches!(outcome, RelayOutcome::Delivered(_)));
    assert_eq!(outcome.disposition(), Disposition::Accepted);
    assert_eq!(publisher.calls(), 1);
    relay.shutdown().await;
}

#[tokio::test]
async fn test_denied_request_never_reaches_publisher() {
    let mut config = config();
    config.admission.per_ip = Some(LimitConfig::per_minute(1));
    let publisher = ScriptedPublisher::ok();
    let mut relay = Relay::new(config, publisher.clone(), None, None, Vec::new());
    let ctx = CancellationToken::new();

    relay.handle(&ctx, &request(), event(1)).await;
    let outcome = relay.handle(&ctx, &request(), event(2)).await;

    match outcome {
        RelayOutcome::Denied {
            scope,
            retry_after_secs,
        } => {
            assert_eq!(scope, Scope::Ip);
            assert!(retry_after_secs >= 1);
        }
        other => panic!("expected denial, got {other:?}"),
    }
    assert!(matches!(
        outcome.disposition(),
        Disposition::RetryLater { .. }
    ));
    assert_eq!(publisher.calls(), 1);
    relay.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_delivery_is_queued_for_redelivery() {
    let mut config = config();
    config.delivery.max_attempts = 2;
    let publisher = ScriptedPublisher::always(PublishError::publish("partition offline"));
    let sink = Arc::new(InMemoryDeadLetterSink::default());
    let mut relay = Relay::new(config, publisher, Some(sink.clone()), None, Vec::new());

    let outcome = relay
        .handle(&CancellationToken::new(), &request(), event(3))
        .await;

    assert_eq!(outcome.disposition(), Disposition::QueuedForRedelivery);
    assert_eq!(sink.len().await, 1);

    let record = sink.drain().await.remove(0);
    let replay = relay.replay(&CancellationToken::new(), &record).await;
    assert!(replay.is_err());
    relay.shutdown().await;
}

#[tokio::test]
async fn test_open_circuit_asks_sender_to_retry_later() {
    let mut config = config();
    config.breaker = CircuitBreakerConfig::default().with_failure_threshold(1);
    config.delivery.max_attempts = 1;
    config.delivery.dead_letter_enabled = false;
    let publisher = ScriptedPublisher::always(PublishError::connection("no route to host"));
    let mut relay = Relay::new(config, publisher.clone(), None, None, Vec::new());
    let ctx = CancellationToken::new();

    let first = relay.handle(&ctx, &request(), event(4)).await;
    assert_eq!(first.disposition(), Disposition::Failed);

    let second = relay.handle(&ctx, &request(), event(5)).await;
    assert_eq!(
        second.disposition(),
        Disposition::RetryLater {
            retry_after_secs: 0
        }
    );
    assert_eq!(publisher.calls(), 1);
    relay.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_refuses_new_requests() {
    let publisher = ScriptedPublisher::ok();
    let mut relay = Relay::new(config(), publisher.clone(), None, None, Vec::new());
    relay.shutdown().await;

    assert!(!relay.is_running());
    let outcome = relay
        .handle(&CancellationToken::new(), &request(), event(6))
        .await;
    assert_eq!(outcome, RelayOutcome::ShuttingDown);
    assert_eq!(publisher.calls(), 0);
}

#[tokio::test]
async fn test_observers_receive_relay_events() {
    let (observer, mut rx) = channel_observer();
    let publisher = ScriptedPublisher::ok();
    let mut relay = Relay::new(config(), publisher, None, None, vec![observer]);

    relay
        .handle(&CancellationToken::new(), &request(), event(7))
        .await;
    relay.shutdown().await;

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(matches!(events[0], PipelineEvent::Admitted));
    assert!(events
        .iter()
        .any(|e| matches!(e, PipelineEvent::Delivered { attempts: 1, .. })));
}
