//! Dead-letters events while the downstream is down, then replays them once
//! it recovers.
//!
//! RUST_LOG=relay=debug cargo run --example replay_dead_letters

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use webhook_relay::{
    Attributes, BackoffPolicy, DeliveryId, Event, InMemoryDeadLetterSink, InboundRequest,
    Observer, PublishError, Publisher, Relay, RelayConfig, TelemetryObserver,
};

struct SwitchableBus {
    healthy: AtomicBool,
}

#[async_trait]
impl Publisher for SwitchableBus {
    async fn publish(
        &self,
        payload: &[u8],
        _attributes: &Attributes,
    ) -> Result<DeliveryId, PublishError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(DeliveryId(format!("msg-{}", payload.len())))
        } else {
            Err(PublishError::publish("partition leader unavailable"))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("relay=info")),
        )
        .init();

    let mut config = RelayConfig::from_env()?;
    config.delivery.max_attempts = 2;
    config.delivery.backoff = BackoffPolicy::Fixed { delay_ms: 20 };

    let bus = Arc::new(SwitchableBus {
        healthy: AtomicBool::new(false),
    });
    let dead_letters = Arc::new(InMemoryDeadLetterSink::default());
    let observers: Vec<Arc<dyn Observer>> = vec![Arc::new(TelemetryObserver)];
    let mut relay = Relay::new(
        config,
        bus.clone(),
        Some(dead_letters.clone()),
        None,
        observers,
    );
    let ctx = CancellationToken::new();
    let request = InboundRequest::new(None).with_header("X-Forwarded-For", "192.0.2.10");

    for n in 0..3u32 {
        let event = Event::new(format!("evt_{n}"), format!(r#"{{"invoice":{n}}}"#));
        let outcome = relay.handle(&ctx, &request, event).await;
        println!("evt_{n} -> {:?}", outcome.disposition());
    }

    bus.healthy.store(true, Ordering::SeqCst);
    relay.breaker().reset();

    for record in dead_letters.drain().await {
        match relay.replay(&ctx, &record).await {
            Ok(id) => println!("replayed {} as {id}", record.event_id.0),
            Err(err) => println!("replay of {} failed: {err}", record.event_id.0),
        }
    }

    relay.shutdown().await;
    Ok(())
}
