#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webhook_relay::{
    Attributes, DeadLetterRecord, DeadLetterSink, DeliveryId, Event, EventBus, Observer,
    PipelineEvent, PublishError, Publisher,
};

/// Returns scripted results in order, then `fallback` forever.
pub struct ScriptedPublisher {
    script: Mutex<VecDeque<Result<DeliveryId, PublishError>>>,
    fallback: Result<DeliveryId, PublishError>,
    calls: AtomicU32,
    published: Mutex<Vec<(Vec<u8>, Attributes)>>,
}

impl ScriptedPublisher {
    pub fn new(
        script: Vec<Result<DeliveryId, PublishError>>,
        fallback: Result<DeliveryId, PublishError>,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicU32::new(0),
            published: Mutex::new(Vec::new()),
        })
    }

    pub fn ok() -> Arc<Self> {
        Self::new(Vec::new(), Ok(DeliveryId("msg-ok".into())))
    }

    pub fn always(error: PublishError) -> Arc<Self> {
        Self::new(Vec::new(), Err(error))
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<(Vec<u8>, Attributes)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl Publisher for ScriptedPublisher {
    async fn publish(
        &self,
        payload: &[u8],
        attributes: &Attributes,
    ) -> Result<DeliveryId, PublishError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.published
            .lock()
            .push((payload.to_vec(), attributes.clone()));
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Never completes.
pub struct HangingPublisher {
    calls: AtomicU32,
}

impl HangingPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Publisher for HangingPublisher {
    async fn publish(
        &self,
        _payload: &[u8],
        _attributes: &Attributes,
    ) -> Result<DeliveryId, PublishError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

/// Cancels the caller's token mid-publish, then fails.
pub struct CancellingPublisher {
    ctx: CancellationToken,
    error: PublishError,
}

impl CancellingPublisher {
    pub fn new(ctx: CancellationToken, error: PublishError) -> Arc<Self> {
        Arc::new(Self { ctx, error })
    }
}

#[async_trait]
impl Publisher for CancellingPublisher {
    async fn publish(
        &self,
        _payload: &[u8],
        _attributes: &Attributes,
    ) -> Result<DeliveryId, PublishError> {
        self.ctx.cancel();
        Err(self.error.clone())
    }
}

/// Succeeds after `delay`.
pub struct SlowPublisher {
    delay: Duration,
}

impl SlowPublisher {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self { delay })
    }
}

#[async_trait]
impl Publisher for SlowPublisher {
    async fn publish(
        &self,
        _payload: &[u8],
        _attributes: &Attributes,
    ) -> Result<DeliveryId, PublishError> {
        tokio::time::sleep(self.delay).await;
        Ok(DeliveryId("slow".into()))
    }
}

/// Dead-letter sink that is always down.
pub struct FailingSink {
    calls: AtomicU32,
}

impl FailingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeadLetterSink for FailingSink {
    async fn divert(&self, _record: &DeadLetterRecord) -> Result<DeliveryId, PublishError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(PublishError::connection("dead-letter topic unreachable"))
    }
}

pub fn event(n: u32) -> Event {
    Event::new(format!("evt_{n}"), format!("{{\"n\":{n}}}"))
        .with_attribute("source", "tests")
}

/// An event bus whose observer forwards everything into a channel.
pub struct Recorder {
    pub bus: EventBus,
    pub shutdown: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
    rx: mpsc::UnboundedReceiver<PipelineEvent>,
}

impl Recorder {
    pub fn spawn() -> Self {
        let (observer, rx) = channel_observer();
        let shutdown = CancellationToken::new();
        let (bus, handle) = EventBus::spawn(vec![observer], 256, shutdown.clone());
        Self {
            bus,
            shutdown,
            handle,
            rx,
        }
    }

    /// Stop the bus and return everything it dispatched.
    pub async fn finish(mut self) -> Vec<PipelineEvent> {
        self.shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn channel_observer() -> (Arc<dyn Observer>, mpsc::UnboundedReceiver<PipelineEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let observer: Arc<dyn Observer> = Arc::new(move |event: &PipelineEvent| {
        let _ = tx.send(event.clone());
    });
    (observer, rx)
}
