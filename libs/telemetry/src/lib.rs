//! Logging setup shared by widget connector binaries and demos.

use anyhow::Result;

mod config;
mod tracing_init;

pub use config::TelemetryConfig;
pub use tracing_init::{init_tracing, with_widget_fields};

/// Installs the subscriber configured from `RUST_LOG` and `LOG_FORMAT`.
pub fn install(service_name: &str) -> Result<()> {
    init_tracing(&TelemetryConfig::from_env(service_name))
}
