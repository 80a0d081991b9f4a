//! A single-process admission and delivery pipeline for inbound webhooks.
//!
//! Each inbound request passes **admission control** (global, per-IP and
//! per-credential token buckets), then a **delivery orchestrator** publishes
//! the event downstream through a **circuit breaker**, retrying transient
//! failures with backoff and diverting what cannot be delivered to a
//! **dead-letter sink**.
//!
//! ## Guarantees
//! - Bounded burst per rate-limit key
//! - Fast failure while the downstream is known to be unhealthy
//! - Retry exhaustion reports the last classified publisher error
//! - Dead-letter failures never replace the primary error
//! - Observers are never on the request path
//!
//! ## Non-Guarantees
//! - Distributed rate limiting (limits are per process)
//! - Exactly-once delivery
//! - Breaker or limiter state across restarts
//! - Delivery of observer events under sustained overload
//!
//! Every component is constructed explicitly and injected; there is no
//! process-wide state. [`Relay`] wires the default arrangement together.

mod admission;
mod backoff;
mod breaker;
mod config;
mod error;
mod limiter;
mod observer;
mod orchestrator;
mod publisher;
mod relay;
mod telemetry;
mod types;

#[cfg(feature = "http")]
mod publisher_http;

#[cfg(feature = "redis")]
mod publisher_redis;

#[cfg(feature = "postgres")]
mod sink_postgres;

pub use admission::{
    AdmissionConfig, AdmissionController, AdmissionDecision, CredentialKeyMode,
    HeaderKeyExtractor, InboundRequest, KeyExtractor,
};
pub use backoff::{Backoff, BackoffPolicy};
pub use breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::RelayConfig;
pub use error::{
    ConfigError, DeadLetterStatus, DeliveryError, Disposition, FailureClass, PublishError,
};
pub use limiter::{
    LimitConfig, RateLimiterStats, TokenBucket, TokenBucketLimiter, DISABLED_RETRY_AFTER_SECS,
};
pub use observer::{EventBus, Observer, PipelineEvent, TelemetryObserver};
pub use orchestrator::{DeliveryConfig, DeliveryOrchestrator};
pub use publisher::{DeadLetterSink, InMemoryDeadLetterSink, Publisher, PublisherSink};
pub use relay::{Relay, RelayOutcome};
pub use types::{
    Attributes, DeadLetterRecord, DeliveryAttempt, DeliveryId, Event, EventId, RateLimitKey,
    Scope,
};

#[cfg(feature = "http")]
pub use publisher_http::{classify_status, HttpPublisher, ATTRIBUTE_HEADER_PREFIX};

#[cfg(feature = "redis")]
pub use publisher_redis::RedisStreamPublisher;

#[cfg(feature = "postgres")]
pub use sink_postgres::PostgresDeadLetterSink;
