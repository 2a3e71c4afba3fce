use std::env;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub json_logs: bool,
    /// Filter used when `RUST_LOG` is unset or invalid.
    pub default_filter: String,
}

impl TelemetryConfig {
    pub fn from_env(default_service_name: &str) -> Self {
        Self::from_lookup(default_service_name, |key| env::var(key).ok())
    }

    pub fn from_lookup<F>(default_service_name: &str, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let service_name = lookup("WIDGET_SERVICE_NAME")
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| default_service_name.to_string());
        let json_logs = lookup("LOG_FORMAT")
            .map(|v| !matches!(v.to_lowercase().as_str(), "text" | "pretty" | "plain"))
            .unwrap_or(true);
        let default_filter = lookup("WIDGET_LOG_DEFAULT").unwrap_or_else(|| "info".into());

        Self {
            service_name,
            json_logs,
            default_filter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_json_logs() {
        let config = TelemetryConfig::from_lookup("widget", |_| None);
        assert_eq!(config.service_name, "widget");
        assert!(config.json_logs);
        assert_eq!(config.default_filter, "info");
    }

    #[test]
    fn plain_formats_disable_json() {
        for format in ["text", "PRETTY", "plain"] {
            let config = TelemetryConfig::from_lookup("widget", |key| {
                (key == "LOG_FORMAT").then(|| format.to_string())
            });
            assert!(!config.json_logs, "{format}");
        }
    }
}
