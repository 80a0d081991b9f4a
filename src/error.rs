use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::DeliveryId;

/// Classification of a failed publish.
///
/// Shared by the circuit breaker (what counts as a downstream failure) and
/// the delivery orchestrator (what is worth retrying, and the dead-letter
/// `failure_reason`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Transport or dial failure reaching the downstream, including an
    /// open circuit and an attempt timeout.
    ConnectionError,
    /// The downstream is throttling us.
    RateLimit,
    /// The downstream accepted the connection but rejected the publish.
    PublishError,
    /// Credentials were rejected.
    AuthError,
    /// The payload was rejected as malformed.
    ValidationError,
    /// Anything unclassified.
    Internal,
    /// The caller cancelled or its deadline elapsed.
    Cancelled,
}

impl FailureClass {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureClass::ConnectionError | FailureClass::RateLimit | FailureClass::PublishError
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::ConnectionError => "connection_error",
            FailureClass::RateLimit => "rate_limit",
            FailureClass::PublishError => "publish_error",
            FailureClass::AuthError => "auth_error",
            FailureClass::ValidationError => "validation_error",
            FailureClass::Internal => "internal",
            FailureClass::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "connection_error" => Some(FailureClass::ConnectionError),
            "rate_limit" => Some(FailureClass::RateLimit),
            "publish_error" => Some(FailureClass::PublishError),
            "auth_error" => Some(FailureClass::AuthError),
            "validation_error" => Some(FailureClass::ValidationError),
            "internal" | "unknown" => Some(FailureClass::Internal),
            "cancelled" => Some(FailureClass::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const CIRCUIT_OPEN_MESSAGE: &str = "circuit breaker is open";

/// Error returned by a [`Publisher`](crate::Publisher) or
/// [`DeadLetterSink`](crate::DeadLetterSink).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{class}: {message}")]
pub struct PublishError {
    pub class: FailureClass,
    pub message: String,
}

impl PublishError {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(FailureClass::ConnectionError, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(FailureClass::RateLimit, message)
    }

    pub fn publish(message: impl Into<String>) -> Self {
        Self::new(FailureClass::PublishError, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(FailureClass::AuthError, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureClass::ValidationError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Internal, message)
    }

    pub fn cancelled() -> Self {
        Self::new(FailureClass::Cancelled, "delivery cancelled by caller")
    }

    /// Synthetic error for a call the breaker refused. Connection-class and
    /// carries no retry-after.
    pub fn circuit_open() -> Self {
        Self::connection(CIRCUIT_OPEN_MESSAGE)
    }

    pub fn timed_out() -> Self {
        Self::connection("publish attempt timed out")
    }

    pub fn is_retryable(&self) -> bool {
        self.class.is_retryable()
    }

    pub fn is_circuit_open(&self) -> bool {
        self.class == FailureClass::ConnectionError && self.message == CIRCUIT_OPEN_MESSAGE
    }
}

/// What happened to the dead-letter diversion of a failed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterStatus {
    /// Diversion disabled, or the classification is excluded by policy.
    NotDiverted,
    /// The sink accepted the record.
    Diverted(DeliveryId),
    /// The sink itself failed. Its error is reported to observers only.
    Failed,
}

/// Final error of [`DeliveryOrchestrator::deliver`](crate::DeliveryOrchestrator::deliver).
///
/// `last_error` is always the last publisher error, never a dead-letter
/// error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("delivery failed after {attempts} attempt(s): {last_error}")]
pub struct DeliveryError {
    #[source]
    pub last_error: PublishError,
    pub attempts: u32,
    pub dead_letter: DeadLetterStatus,
}

impl DeliveryError {
    pub fn class(&self) -> FailureClass {
        self.last_error.class
    }

    pub fn disposition(&self) -> Disposition {
        let class = self.last_error.class;
        if class == FailureClass::Cancelled {
            return Disposition::Cancelled;
        }
        if !class.is_retryable() {
            return Disposition::Rejected;
        }
        match self.dead_letter {
            DeadLetterStatus::Diverted(_) => Disposition::QueuedForRedelivery,
            _ if self.last_error.is_circuit_open() => Disposition::RetryLater {
                retry_after_secs: 0,
            },
            DeadLetterStatus::NotDiverted | DeadLetterStatus::Failed => Disposition::Failed,
        }
    }
}

/// What the boundary should tell the webhook sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Delivered downstream.
    Accepted,
    /// Too busy; retry later. Admission denial or an open circuit. An open
    /// circuit carries no hint, so `retry_after_secs` is zero.
    RetryLater { retry_after_secs: u64 },
    /// Request rejected; do not retry.
    Rejected,
    /// Temporarily failed, already queued for redelivery.
    QueuedForRedelivery,
    /// Failed, and nothing holds the event.
    Failed,
    /// The caller went away before an outcome was reached.
    Cancelled,
}

/// Errors raised while loading [`RelayConfig`](crate::RelayConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: String, reason: String },

    #[error("malformed configuration document: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes_match_taxonomy() {
        assert!(FailureClass::ConnectionError.is_retryable());
        assert!(FailureClass::RateLimit.is_retryable());
        assert!(FailureClass::PublishError.is_retryable());
        assert!(!FailureClass::AuthError.is_retryable());
        assert!(!FailureClass::ValidationError.is_retryable());
        assert!(!FailureClass::Internal.is_retryable());
        assert!(!FailureClass::Cancelled.is_retryable());
    }

    #[test]
    fn unknown_parses_as_internal() {
        assert_eq!(FailureClass::parse("unknown"), Some(FailureClass::Internal));
        assert_eq!(FailureClass::parse("bogus"), None);
    }

    #[test]
    fn circuit_open_is_connection_class() {
        let err = PublishError::circuit_open();
        assert_eq!(err.class, FailureClass::ConnectionError);
        assert!(err.is_circuit_open());
        assert!(!PublishError::connection("dial tcp: refused").is_circuit_open());
    }

    #[test]
    fn disposition_follows_classification_and_dead_letter() {
        let err = |class, dead_letter| DeliveryError {
            last_error: PublishError::new(class, "boom"),
            attempts: 3,
            dead_letter,
        };

        assert_eq!(
            err(FailureClass::AuthError, DeadLetterStatus::NotDiverted).disposition(),
            Disposition::Rejected
        );
        assert_eq!(
            err(
                FailureClass::PublishError,
                DeadLetterStatus::Diverted(DeliveryId("dlq-1".into()))
            )
            .disposition(),
            Disposition::QueuedForRedelivery
        );
        assert_eq!(
            err(FailureClass::PublishError, DeadLetterStatus::Failed).disposition(),
            Disposition::Failed
        );
        assert_eq!(
            err(FailureClass::Cancelled, DeadLetterStatus::NotDiverted).disposition(),
            Disposition::Cancelled
        );
    }

    #[test]
    fn undiverted_circuit_open_asks_sender_to_retry() {
        let err = DeliveryError {
            last_error: PublishError::circuit_open(),
            attempts: 1,
            dead_letter: DeadLetterStatus::NotDiverted,
        };
        assert_eq!(
            err.disposition(),
            Disposition::RetryLater {
                retry_after_secs: 0
            }
        );
    }
}
