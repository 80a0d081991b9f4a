//! Admission control: global, per-IP and per-credential token buckets.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Disposition;
use crate::limiter::{LimitConfig, TokenBucketLimiter};
use crate::observer::{EventBus, PipelineEvent};
use crate::telemetry::{metric_inc, metric_inc_labeled};
use crate::types::{RateLimitKey, Scope};

/// How a credential becomes a limiter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKeyMode {
    /// The presented credential itself.
    #[default]
    Raw,
    /// Hex SHA-256 of the credential, so raw secrets never sit in the map.
    Sha256,
}

impl CredentialKeyMode {
    fn key_for(self, credential: &str) -> RateLimitKey {
        match self {
            CredentialKeyMode::Raw => RateLimitKey::new(credential),
            CredentialKeyMode::Sha256 => {
                RateLimitKey::new(hex::encode(Sha256::digest(credential.as_bytes())))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub global: Option<LimitConfig>,
    pub per_ip: Option<LimitConfig>,
    pub per_credential: Option<LimitConfig>,
    pub credential_key_mode: CredentialKeyMode,
    pub forwarded_header: String,
    pub credential_header: String,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            global: Some(LimitConfig {
                requests_per_second: 1_000.0,
                burst: 2_000,
                idle_window_secs: 0,
            }),
            per_ip: Some(LimitConfig::default()),
            per_credential: None,
            credential_key_mode: CredentialKeyMode::Raw,
            forwarded_header: "X-Forwarded-For".to_string(),
            credential_header: "Authorization".to_string(),
        }
    }
}

/// The parts of an inbound request admission cares about.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    headers: Vec<(String, String)>,
    peer_addr: Option<IpAddr>,
}

impl InboundRequest {
    pub fn new(peer_addr: Option<IpAddr>) -> Self {
        Self {
            headers: Vec::new(),
            peer_addr,
        }
    }

    pub fn from_headers<'a, I>(headers: I, peer_addr: Option<IpAddr>) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        Self {
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            peer_addr,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn peer_addr(&self) -> Option<IpAddr> {
        self.peer_addr
    }
}

/// Maps a request to the `(scope, key)` pairs it should be limited under.
///
/// The global scope needs no key. A request with no `Ip` pair is denied
/// by the per-IP scope; one with no `Credential` pair skips the
/// per-credential scope.
pub trait KeyExtractor: Send + Sync {
    fn extract(&self, request: &InboundRequest) -> Vec<(Scope, RateLimitKey)>;
}

/// Reads the client address from a forwarded-for header (falling back to
/// the peer address) and the credential from an authorization header.
#[derive(Debug, Clone)]
pub struct HeaderKeyExtractor {
    forwarded_header: String,
    credential_header: String,
    credential_mode: CredentialKeyMode,
}

impl HeaderKeyExtractor {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            forwarded_header: config.forwarded_header.clone(),
            credential_header: config.credential_header.clone(),
            credential_mode: config.credential_key_mode,
        }
    }

    fn client_ip(&self, request: &InboundRequest) -> Option<String> {
        let forwarded = request
            .header(&self.forwarded_header)
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|first| !first.is_empty());

        match forwarded {
            Some(first) => Some(first.to_string()),
            None => request.peer_addr().map(|addr| addr.to_string()),
        }
    }

    fn credential(&self, request: &InboundRequest) -> Option<String> {
        let value = request.header(&self.credential_header)?.trim();
        let token = match value.split_once(' ') {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
            _ => value,
        };
        (!token.is_empty()).then(|| token.to_string())
    }
}

impl KeyExtractor for HeaderKeyExtractor {
    fn extract(&self, request: &InboundRequest) -> Vec<(Scope, RateLimitKey)> {
        let mut keys = Vec::with_capacity(2);
        if let Some(ip) = self.client_ip(request) {
            keys.push((Scope::Ip, RateLimitKey::new(ip)));
        }
        if let Some(credential) = self.credential(request) {
            keys.push((Scope::Credential, self.credential_mode.key_for(&credential)));
        }
        keys
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admitted,
    Denied { scope: Scope, retry_after_secs: u64 },
}

impl AdmissionDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionDecision::Admitted)
    }

    /// `None` when admitted.
    pub fn disposition(&self) -> Option<Disposition> {
        match *self {
            AdmissionDecision::Admitted => None,
            AdmissionDecision::Denied {
                retry_after_secs, ..
            } => Some(Disposition::RetryLater { retry_after_secs }),
        }
    }
}

/// Evaluates the configured scopes in order (global, IP, credential) and
/// stops at the first denial.
pub struct AdmissionController {
    limiters: Vec<(Scope, TokenBucketLimiter)>,
    extractor: Arc<dyn KeyExtractor>,
    events: EventBus,
}

impl AdmissionController {
    pub fn new(config: &AdmissionConfig, events: EventBus) -> Self {
        Self::with_extractor(config, Arc::new(HeaderKeyExtractor::new(config)), events)
    }

    pub fn with_extractor(
        config: &AdmissionConfig,
        extractor: Arc<dyn KeyExtractor>,
        events: EventBus,
    ) -> Self {
        let limiters = [
            (Scope::Global, config.global),
            (Scope::Ip, config.per_ip),
            (Scope::Credential, config.per_credential),
        ]
        .into_iter()
        .filter_map(|(scope, limit)| limit.map(|l| (scope, TokenBucketLimiter::new(l))))
        .collect();

        Self {
            limiters,
            extractor,
            events,
        }
    }

    pub fn admit(&self, request: &InboundRequest) -> AdmissionDecision {
        let keys = self.extractor.extract(request);
        self.admit_keys(&keys)
    }

    /// Decide from already-extracted keys.
    pub fn admit_keys(&self, keys: &[(Scope, RateLimitKey)]) -> AdmissionDecision {
        let empty = RateLimitKey::new("");
        let global = RateLimitKey::global();

        for (scope, limiter) in &self.limiters {
            let presented = keys.iter().find(|(s, _)| s == scope).map(|(_, key)| key);
            let key = match (scope, presented) {
                (Scope::Global, _) => &global,
                (_, Some(key)) => key,
                (Scope::Ip, None) => &empty,
                (Scope::Credential, None) => continue,
            };

            let (allowed, retry_after_secs) = limiter.allow_or_reason(key);
            if !allowed {
                metric_inc_labeled("relay.admission.denied", "scope", scope.as_str());
                self.events.emit(PipelineEvent::AdmissionDenied {
                    scope: *scope,
                    retry_after_secs,
                });
                return AdmissionDecision::Denied {
                    scope: *scope,
                    retry_after_secs,
                };
            }
        }

        metric_inc("relay.admission.admitted");
        self.events.emit(PipelineEvent::Admitted);
        AdmissionDecision::Admitted
    }

    pub fn limiter(&self, scope: Scope) -> Option<&TokenBucketLimiter> {
        self.limiters
            .iter()
            .find(|(s, _)| *s == scope)
            .map(|(_, limiter)| limiter)
    }

    /// Sweep idle buckets from every scope. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        self.limiters
            .iter()
            .map(|(_, limiter)| limiter.cleanup_expired())
            .sum()
    }

    /// Run [`cleanup_expired`](Self::cleanup_expired) every `period` until
    /// `shutdown` is cancelled.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        period: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.cleanup_expired();
                        #[cfg(feature = "tracing")]
                        tracing::debug!(target: "relay::admission", removed, "swept idle buckets");
                        #[cfg(not(feature = "tracing"))]
                        let _ = removed;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> HeaderKeyExtractor {
        HeaderKeyExtractor::new(&AdmissionConfig::default())
    }

    #[test]
    fn forwarded_for_uses_leftmost_trimmed_entry() {
        let request = InboundRequest::new(Some("10.0.0.1".parse().unwrap()))
            .with_header("x-forwarded-for", "  203.0.113.7 , 198.51.100.2");
        let keys = extractor().extract(&request);
        assert_eq!(keys, vec![(Scope::Ip, RateLimitKey::new("203.0.113.7"))]);
    }

    #[test]
    fn falls_back_to_peer_address() {
        let request = InboundRequest::new(Some("10.0.0.1".parse().unwrap()))
            .with_header("X-Forwarded-For", " ");
        let keys = extractor().extract(&request);
        assert_eq!(keys, vec![(Scope::Ip, RateLimitKey::new("10.0.0.1"))]);
    }

    #[test]
    fn bearer_prefix_is_stripped() {
        let request = InboundRequest::new(None).with_header("Authorization", "Bearer tok_123");
        let keys = extractor().extract(&request);
        assert_eq!(keys, vec![(Scope::Credential, RateLimitKey::new("tok_123"))]);
    }

    #[test]
    fn hashed_credentials_hide_the_token() {
        let config = AdmissionConfig {
            credential_key_mode: CredentialKeyMode::Sha256,
            ..AdmissionConfig::default()
        };
        let request = InboundRequest::new(None).with_header("Authorization", "Bearer tok_123");
        let keys = HeaderKeyExtractor::new(&config).extract(&request);
        let (_, key) = &keys[0];
        assert_eq!(key.as_str().len(), 64);
        assert!(!key.as_str().contains("tok_123"));
    }

    #[test]
    fn denied_decision_maps_to_retry_later() {
        let decision = AdmissionDecision::Denied {
            scope: Scope::Ip,
            retry_after_secs: 4,
        };
        assert_eq!(
            decision.disposition(),
            Some(Disposition::RetryLater { retry_after_secs: 4 })
        );
        assert_eq!(AdmissionDecision::Admitted.disposition(), None);
    }
}
