use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FailureClass;

/// Message attributes forwarded alongside a payload.
pub type Attributes = BTreeMap<String, String>;

/// Limiter scope a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Global,
    Ip,
    Credential,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Ip => "ip",
            Scope::Credential => "credential",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque key identifying one bucket within a limiter.
///
/// Each scope owns its own limiter, so equal key strings in different
/// scopes never share a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateLimitKey(pub String);

impl RateLimitKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key of the single global bucket.
    pub fn global() -> Self {
        Self("global".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for RateLimitKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RateLimitKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier for an inbound event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

/// Identifier the message bus assigned to a published message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryId(pub String);

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A transformed webhook event ready for publishing.
///
/// The payload is opaque bytes; mapping the inbound body into it is the
/// caller's concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub payload: Vec<u8>,
    pub attributes: Attributes,
}

impl Event {
    pub fn new(id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: EventId(id.into()),
            payload: payload.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes.extend(attributes);
        self
    }
}

/// One try at publishing an event.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub event: Arc<Event>,
    /// 1-based.
    pub attempt: u32,
    /// Time since the first attempt started.
    pub elapsed: Duration,
    pub result: Result<DeliveryId, FailureClass>,
}

const DLQ_PREFIX: &str = "dlq.";
const DLQ_EVENT_ID: &str = "dlq.event_id";
const DLQ_FAILURE_REASON: &str = "dlq.failure_reason";
const DLQ_RETRY_COUNT: &str = "dlq.retry_count";
const DLQ_FIRST_ATTEMPT: &str = "dlq.first_attempt_secs";
const DLQ_DEAD_LETTERED_AT: &str = "dlq.dead_lettered_at_secs";
const DLQ_LAST_ERROR: &str = "dlq.last_error";

/// An event that could not be delivered, with enough context to diagnose
/// and replay it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub event_id: EventId,
    pub payload: Vec<u8>,
    pub attributes: Attributes,
    pub failure_reason: FailureClass,
    /// Attempts actually made, including ones refused by the breaker.
    pub retry_count: u32,
    pub first_attempt_secs: u64,
    pub dead_lettered_at_secs: u64,
    pub last_error_message: String,
}

impl DeadLetterRecord {
    /// Flatten into a message any [`Publisher`](crate::Publisher) can carry.
    ///
    /// The original attributes are kept and the metadata is added under
    /// `dlq.*` keys.
    pub fn to_message(&self) -> (Vec<u8>, Attributes) {
        let mut attributes = self.attributes.clone();
        attributes.insert(DLQ_EVENT_ID.to_string(), self.event_id.0.clone());
        attributes.insert(
            DLQ_FAILURE_REASON.to_string(),
            self.failure_reason.as_str().to_string(),
        );
        attributes.insert(DLQ_RETRY_COUNT.to_string(), self.retry_count.to_string());
        attributes.insert(
            DLQ_FIRST_ATTEMPT.to_string(),
            self.first_attempt_secs.to_string(),
        );
        attributes.insert(
            DLQ_DEAD_LETTERED_AT.to_string(),
            self.dead_lettered_at_secs.to_string(),
        );
        attributes.insert(DLQ_LAST_ERROR.to_string(), self.last_error_message.clone());
        (self.payload.clone(), attributes)
    }

    /// Inverse of [`to_message`](Self::to_message). Returns `None` when the
    /// metadata attributes are missing or malformed.
    ///
    /// Original attributes whose names start with `dlq.` do not survive the
    /// round trip.
    pub fn from_message(payload: Vec<u8>, attributes: &Attributes) -> Option<Self> {
        let event_id = attributes.get(DLQ_EVENT_ID)?.clone();
        let failure_reason = FailureClass::parse(attributes.get(DLQ_FAILURE_REASON)?)?;
        let retry_count = attributes.get(DLQ_RETRY_COUNT)?.parse().ok()?;
        let first_attempt_secs = attributes.get(DLQ_FIRST_ATTEMPT)?.parse().ok()?;
        let dead_lettered_at_secs = attributes.get(DLQ_DEAD_LETTERED_AT)?.parse().ok()?;
        let last_error_message = attributes.get(DLQ_LAST_ERROR).cloned().unwrap_or_default();

        let original = attributes
            .iter()
            .filter(|(key, _)| !key.starts_with(DLQ_PREFIX))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Some(Self {
            event_id: EventId(event_id),
            payload,
            attributes: original,
            failure_reason,
            retry_count,
            first_attempt_secs,
            dead_lettered_at_secs,
            last_error_message,
        })
    }

    /// Rebuild the event this record was created from.
    pub fn to_event(&self) -> Event {
        Event {
            id: self.event_id.clone(),
            payload: self.payload.clone(),
            attributes: self.attributes.clone(),
        }
    }
}

pub(crate) fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> DeadLetterRecord {
        DeadLetterRecord {
            event_id: EventId("evt_1".into()),
            payload: br#"{"order":42}"#.to_vec(),
            attributes: Attributes::from([("source".to_string(), "shop".to_string())]),
            failure_reason: FailureClass::PublishError,
            retry_count: 3,
            first_attempt_secs: 1_700_000_000,
            dead_lettered_at_secs: 1_700_000_007,
            last_error_message: "topic rejected message".into(),
        }
    }

    #[test]
    fn dead_letter_message_carries_metadata() {
        let (payload, attributes) = record().to_message();
        assert_eq!(payload, br#"{"order":42}"#.to_vec());
        assert_eq!(attributes["source"], "shop");
        assert_eq!(attributes["dlq.failure_reason"], "publish_error");
        assert_eq!(attributes["dlq.retry_count"], "3");
        assert_eq!(attributes["dlq.last_error"], "topic rejected message");
    }

    #[test]
    fn dead_letter_message_parses_back() {
        let original = record();
        let (payload, attributes) = original.to_message();
        let parsed = DeadLetterRecord::from_message(payload, &attributes).expect("parse");
        assert_eq!(parsed, original);
    }

    #[test]
    fn message_without_metadata_is_not_a_record() {
        let attributes = Attributes::from([("source".to_string(), "shop".to_string())]);
        assert!(DeadLetterRecord::from_message(Vec::new(), &attributes).is_none());
    }
}
