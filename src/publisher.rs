use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::PublishError;
use crate::types::{Attributes, DeadLetterRecord, DeliveryId};

/// Downstream message bus.
///
/// Cancellation is by drop: the orchestrator abandons the returned future
/// when the caller goes away, so implementations must not rely on running
/// to completion.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        payload: &[u8],
        attributes: &Attributes,
    ) -> Result<DeliveryId, PublishError>;
}

#[async_trait]
impl<P: Publisher + ?Sized> Publisher for Arc<P> {
    async fn publish(
        &self,
        payload: &[u8],
        attributes: &Attributes,
    ) -> Result<DeliveryId, PublishError> {
        (**self).publish(payload, attributes).await
    }
}

/// Destination for events that could not be delivered.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn divert(&self, record: &DeadLetterRecord) -> Result<DeliveryId, PublishError>;
}

#[async_trait]
impl<S: DeadLetterSink + ?Sized> DeadLetterSink for Arc<S> {
    async fn divert(&self, record: &DeadLetterRecord) -> Result<DeliveryId, PublishError> {
        (**self).divert(record).await
    }
}

/// Uses any [`Publisher`] as a dead-letter sink, flattening each record with
/// [`DeadLetterRecord::to_message`].
#[derive(Debug, Clone)]
pub struct PublisherSink<P> {
    publisher: P,
}

impl<P: Publisher> PublisherSink<P> {
    pub fn new(publisher: P) -> Self {
        Self { publisher }
    }

    pub fn inner(&self) -> &P {
        &self.publisher
    }
}

#[async_trait]
impl<P: Publisher> DeadLetterSink for PublisherSink<P> {
    async fn divert(&self, record: &DeadLetterRecord) -> Result<DeliveryId, PublishError> {
        let (payload, attributes) = record.to_message();
        self.publisher.publish(&payload, &attributes).await
    }
}

/// Bounded in-process dead-letter sink. Oldest records are dropped once
/// `capacity` is reached.
#[derive(Debug)]
pub struct InMemoryDeadLetterSink {
    records: Mutex<VecDeque<DeadLetterRecord>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl Default for InMemoryDeadLetterSink {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl InMemoryDeadLetterSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn snapshot(&self) -> Vec<DeadLetterRecord> {
        let guard = self.records.lock().await;
        guard.iter().cloned().collect()
    }

    /// Remove and return every held record, e.g. for replay.
    pub async fn drain(&self) -> Vec<DeadLetterRecord> {
        let mut guard = self.records.lock().await;
        guard.drain(..).collect()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn divert(&self, record: &DeadLetterRecord) -> Result<DeliveryId, PublishError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.records.lock().await;
        guard.push_back(record.clone());
        while guard.len() > self.capacity {
            guard.pop_front();
        }
        Ok(DeliveryId(format!("dlq-{id}")))
    }
}
