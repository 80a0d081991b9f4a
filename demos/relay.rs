//! Pushes a burst of webhooks from a few clients through a relay whose
//! downstream fails intermittently.
//!
//! RUST_LOG=relay=debug cargo run --example relay

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use webhook_relay::{
    Attributes, DeliveryId, Event, InMemoryDeadLetterSink, InboundRequest, Observer,
    PublishError, Publisher, Relay, RelayConfig, TelemetryObserver,
};

/// Fails every third publish.
struct FlakyBus {
    published: AtomicU32,
}

#[async_trait]
impl Publisher for FlakyBus {
    async fn publish(
        &self,
        _payload: &[u8],
        _attributes: &Attributes,
    ) -> Result<DeliveryId, PublishError> {
        let n = self.published.fetch_add(1, Ordering::SeqCst) + 1;
        if n % 3 == 0 {
            Err(PublishError::connection("broker connection reset"))
        } else {
            Ok(DeliveryId(format!("msg-{n}")))
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

    let config = RelayConfig::from_env()?;
    let publisher = Arc::new(FlakyBus {
        published: AtomicU32::new(0),
    });
    let dead_letters = Arc::new(InMemoryDeadLetterSink::default());
    let observers: Vec<Arc<dyn Observer>> = vec![Arc::new(TelemetryObserver)];

    let mut relay = Relay::new(
        config,
        publisher,
        Some(dead_letters.clone()),
        None,
        observers,
    );
    let ctx = CancellationToken::new();

    for n in 0..30u32 {
        let client = format!("203.0.113.{}", n % 3);
        let request = InboundRequest::new(None)
            .with_header("X-Forwarded-For", client.as_str())
            .with_header("Authorization", "Bearer demo-key");
        let event = Event::new(format!("evt_{n}"), format!(r#"{{"order":{n}}}"#))
            .with_attribute("topic", "orders");

        let outcome = relay.handle(&ctx, &request, event).await;
        println!("evt_{n:<3} from {client:<14} -> {:?}", outcome.disposition());
    }

    relay.shutdown().await;
    println!(
        "breaker: {:?}, dead letters held: {}",
        relay.breaker().snapshot(),
        dead_letters.len().await
    );
    Ok(())
}
