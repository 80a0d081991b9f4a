//! Relay configuration: serde defaults, JSON documents and `RELAY_*`
//! environment overrides.

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::admission::{AdmissionConfig, CredentialKeyMode};
use crate::breaker::CircuitBreakerConfig;
use crate::error::ConfigError;
use crate::limiter::LimitConfig;
use crate::orchestrator::DeliveryConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub admission: AdmissionConfig,
    pub breaker: CircuitBreakerConfig,
    pub delivery: DeliveryConfig,
    /// How often idle limiter buckets are swept. `0` disables the sweeper.
    pub sweep_interval_ms: u64,
    /// Capacity of the observer event channel. `0` disables observers.
    pub event_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            admission: AdmissionConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            delivery: DeliveryConfig::default(),
            sweep_interval_ms: 60_000,
            event_buffer: 1_024,
        }
    }
}

impl RelayConfig {
    pub fn from_json_str(document: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_str(document)?;
        // `0` means no per-attempt timeout, as in the environment.
        config.delivery.attempt_timeout_ms = config.delivery.attempt_timeout_ms.filter(|ms| *ms > 0);
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by the process environment.
    ///
    /// Recognised variables:
    /// - `RELAY_MAX_ATTEMPTS`, `RELAY_ATTEMPT_TIMEOUT_MS` (`0` = no timeout)
    /// - `RELAY_DEAD_LETTER_ENABLED`, `RELAY_DEAD_LETTER_TERMINAL`,
    ///   `RELAY_DEAD_LETTER_TIMEOUT_MS`
    /// - `RELAY_BREAKER_FAILURE_THRESHOLD`, `RELAY_BREAKER_SUCCESS_THRESHOLD`,
    ///   `RELAY_BREAKER_TIMEOUT_MS`, `RELAY_BREAKER_MAX_HALF_OPEN`
    /// - `RELAY_{GLOBAL,IP,CREDENTIAL}_RPS` (`off` disables the scope) and
    ///   `RELAY_{GLOBAL,IP,CREDENTIAL}_BURST`
    /// - `RELAY_CREDENTIAL_KEY_MODE`: `raw` (default) or `sha256`
    /// - `RELAY_SWEEP_INTERVAL_MS`, `RELAY_EVENT_BUFFER`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(raw) = get("RELAY_MAX_ATTEMPTS") {
            config.delivery.max_attempts = parse("RELAY_MAX_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = get("RELAY_ATTEMPT_TIMEOUT_MS") {
            let ms: u64 = parse("RELAY_ATTEMPT_TIMEOUT_MS", &raw)?;
            config.delivery.attempt_timeout_ms = (ms > 0).then_some(ms);
        }
        if let Some(raw) = get("RELAY_DEAD_LETTER_ENABLED") {
            config.delivery.dead_letter_enabled = parse_bool("RELAY_DEAD_LETTER_ENABLED", &raw)?;
        }
        if let Some(raw) = get("RELAY_DEAD_LETTER_TERMINAL") {
            config.delivery.dead_letter_terminal =
                parse_bool("RELAY_DEAD_LETTER_TERMINAL", &raw)?;
        }
        if let Some(raw) = get("RELAY_DEAD_LETTER_TIMEOUT_MS") {
            config.delivery.dead_letter_timeout_ms = parse("RELAY_DEAD_LETTER_TIMEOUT_MS", &raw)?;
        }

        if let Some(raw) = get("RELAY_BREAKER_FAILURE_THRESHOLD") {
            config.breaker.failure_threshold = parse("RELAY_BREAKER_FAILURE_THRESHOLD", &raw)?;
        }
        if let Some(raw) = get("RELAY_BREAKER_SUCCESS_THRESHOLD") {
            config.breaker.success_threshold = parse("RELAY_BREAKER_SUCCESS_THRESHOLD", &raw)?;
        }
        if let Some(raw) = get("RELAY_BREAKER_TIMEOUT_MS") {
            config.breaker.timeout_ms = parse("RELAY_BREAKER_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = get("RELAY_BREAKER_MAX_HALF_OPEN") {
            config.breaker.max_half_open_requests = parse("RELAY_BREAKER_MAX_HALF_OPEN", &raw)?;
        }

        apply_limit(&get, "GLOBAL", &mut config.admission.global)?;
        apply_limit(&get, "IP", &mut config.admission.per_ip)?;
        apply_limit(&get, "CREDENTIAL", &mut config.admission.per_credential)?;

        if let Some(raw) = get("RELAY_CREDENTIAL_KEY_MODE") {
            config.admission.credential_key_mode = raw.parse()?;
        }
        if let Some(raw) = get("RELAY_SWEEP_INTERVAL_MS") {
            config.sweep_interval_ms = parse("RELAY_SWEEP_INTERVAL_MS", &raw)?;
        }
        if let Some(raw) = get("RELAY_EVENT_BUFFER") {
            config.event_buffer = parse("RELAY_EVENT_BUFFER", &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_ms > 0).then(|| Duration::from_millis(self.sweep_interval_ms))
    }

    /// Reject values that would make a component unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.delivery.max_attempts == 0 {
            return Err(invalid("RELAY_MAX_ATTEMPTS", "must be at least 1"));
        }
        if self.delivery.dead_letter_timeout_ms == 0 {
            return Err(invalid("RELAY_DEAD_LETTER_TIMEOUT_MS", "must be at least 1"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(invalid("RELAY_BREAKER_FAILURE_THRESHOLD", "must be at least 1"));
        }
        if self.breaker.success_threshold == 0 {
            return Err(invalid("RELAY_BREAKER_SUCCESS_THRESHOLD", "must be at least 1"));
        }
        if self.breaker.max_half_open_requests == 0 {
            return Err(invalid("RELAY_BREAKER_MAX_HALF_OPEN", "must be at least 1"));
        }
        for (var, limit) in [
            ("RELAY_GLOBAL_RPS", &self.admission.global),
            ("RELAY_IP_RPS", &self.admission.per_ip),
            ("RELAY_CREDENTIAL_RPS", &self.admission.per_credential),
        ] {
            if let Some(limit) = limit {
                if !limit.requests_per_second.is_finite() || limit.requests_per_second < 0.0 {
                    return Err(invalid(var, "must be a non-negative number"));
                }
            }
        }
        Ok(())
    }
}

impl FromStr for CredentialKeyMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(Self::Raw),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            _ => Err(invalid(
                "RELAY_CREDENTIAL_KEY_MODE",
                format!("unknown mode: {s}"),
            )),
        }
    }
}

fn apply_limit<G>(get: &G, scope: &str, slot: &mut Option<LimitConfig>) -> Result<(), ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let rps_var = format!("RELAY_{scope}_RPS");
    let burst_var = format!("RELAY_{scope}_BURST");

    if let Some(raw) = get(&rps_var) {
        if raw.eq_ignore_ascii_case("off") {
            *slot = None;
            return Ok(());
        }
        let rps: f64 = parse(&rps_var, &raw)?;
        slot.get_or_insert_with(LimitConfig::default).requests_per_second = rps;
    }
    if let Some(raw) = get(&burst_var) {
        let burst: u32 = parse(&burst_var, &raw)?;
        slot.get_or_insert_with(LimitConfig::default).burst = burst;
    }
    Ok(())
}

fn parse<T>(var: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse().map_err(|e: T::Err| invalid(var, e.to_string()))
}

fn parse_bool(var: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, format!("expected a boolean, got {raw}"))),
    }
}

fn invalid(var: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var: var.to_string(),
        reason: reason.into(),
    }
}
