use std::{env, time::Duration};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdapterConfig {
    /// Identity re-check interval used alongside push notifications.
    pub token_poll_interval: Duration,
    /// Interval at which the raw transport state is re-read.
    pub status_poll_interval: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            token_poll_interval: Duration::from_millis(2_000),
            status_poll_interval: Duration::from_millis(1_000),
        }
    }
}

impl AdapterConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let millis = |key: &str| {
            lookup(key)
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
        };
        let defaults = Self::default();
        Self {
            token_poll_interval: millis("WIDGET_TOKEN_POLL_MS")
                .unwrap_or(defaults.token_poll_interval),
            status_poll_interval: millis("WIDGET_STATUS_POLL_MS")
                .unwrap_or(defaults.status_poll_interval),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_intervals_fall_back_to_defaults() {
        let config = AdapterConfig::from_lookup(|key| match key {
            "WIDGET_TOKEN_POLL_MS" => Some("0".into()),
            "WIDGET_STATUS_POLL_MS" => Some("250".into()),
            _ => None,
        });
        assert_eq!(config.token_poll_interval, Duration::from_millis(2_000));
        assert_eq!(config.status_poll_interval, Duration::from_millis(250));
    }
}
