use std::{env, str::FromStr, time::Duration};

use widget_resilience::{CircuitOptions, RetryOptions};

use crate::registry::DEFAULT_MAX_PENDING_MESSAGES;
use crate::scheduler::ReconnectPolicy;

/// Status codes worth retrying when fetching a realtime token.
pub const AUTH_RETRYABLE_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

#[derive(Clone, Debug, PartialEq)]
pub struct RealtimeConfig {
    /// Ceiling for the handshake and for each reconnect attempt.
    pub connect_timeout: Duration,
    /// How long `Failed`/`Suspended` may last before local fallback kicks in.
    pub fallback_dwell: Duration,
    pub detached_reattach_delay: Duration,
    pub failed_reattach_delay: Duration,
    pub max_pending_messages: usize,
    /// Capacity of the connection and local event broadcast channels.
    pub event_buffer: usize,
    pub reconnect: ReconnectPolicy,
    pub auth_retry: RetryOptions,
    pub auth_circuit: CircuitOptions,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            fallback_dwell: Duration::from_secs(30),
            detached_reattach_delay: Duration::from_millis(2_000),
            failed_reattach_delay: Duration::from_millis(3_000),
            max_pending_messages: DEFAULT_MAX_PENDING_MESSAGES,
            event_buffer: 64,
            reconnect: ReconnectPolicy::default(),
            auth_retry: RetryOptions::default()
                .with_retryable_status_codes(AUTH_RETRYABLE_STATUS_CODES),
            auth_circuit: CircuitOptions::default(),
        }
    }
}

impl RealtimeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from `lookup`; unset or unparsable values keep
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let millis = |key: &str| parse::<u64>(&lookup, key).map(Duration::from_millis);

        if let Some(value) = millis("WIDGET_REALTIME_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = value;
        }
        if let Some(value) = millis("WIDGET_REALTIME_FALLBACK_DWELL_MS") {
            config.fallback_dwell = value;
        }
        if let Some(value) = millis("WIDGET_REALTIME_DETACHED_REATTACH_MS") {
            config.detached_reattach_delay = value;
        }
        if let Some(value) = millis("WIDGET_REALTIME_FAILED_REATTACH_MS") {
            config.failed_reattach_delay = value;
        }
        if let Some(value) = parse::<usize>(&lookup, "WIDGET_REALTIME_MAX_PENDING") {
            config.max_pending_messages = value.max(1);
        }
        if let Some(value) = parse::<usize>(&lookup, "WIDGET_REALTIME_EVENT_BUFFER") {
            config.event_buffer = value.max(1);
        }
        if let Some(value) = millis("WIDGET_RECONNECT_INITIAL_DELAY_MS") {
            config.reconnect.initial_delay = value;
        }
        if let Some(value) = millis("WIDGET_RECONNECT_MAX_DELAY_MS") {
            config.reconnect.max_delay = value;
        }
        if let Some(value) = parse::<u32>(&lookup, "WIDGET_RECONNECT_MAX_ATTEMPTS") {
            config.reconnect.max_attempts = value;
        }
        if let Some(value) = parse::<f64>(&lookup, "WIDGET_RECONNECT_BACKOFF_FACTOR") {
            if value >= 1.0 {
                config.reconnect.backoff_factor = value;
            }
        }
        config
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|raw| raw.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_match_documented_timings() {
        let config = RealtimeConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.fallback_dwell, Duration::from_secs(30));
        assert_eq!(config.reconnect.max_attempts, 20);
        assert_eq!(config.auth_circuit.failure_threshold, 5);
    }

    #[test]
    fn lookup_overrides_and_ignores_garbage() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("WIDGET_REALTIME_CONNECT_TIMEOUT_MS", "2500"),
            ("WIDGET_REALTIME_MAX_PENDING", "0"),
            ("WIDGET_RECONNECT_MAX_ATTEMPTS", "four"),
            ("WIDGET_RECONNECT_BACKOFF_FACTOR", "0.5"),
        ]);
        let config = RealtimeConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.connect_timeout, Duration::from_millis(2_500));
        assert_eq!(config.max_pending_messages, 1);
        assert_eq!(config.reconnect.max_attempts, 20);
        assert_eq!(config.reconnect.backoff_factor, 1.5);
    }
}
