use std::sync::OnceLock;

use anyhow::Result;
use tracing::Span;
use tracing_subscriber::layer::Layer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::TelemetryConfig;

static INIT: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber once; later calls are no-ops.
pub fn init_tracing(cfg: &TelemetryConfig) -> Result<()> {
    if INIT.get().is_some() {
        return Ok(());
    }

    let fmt_layer = if cfg.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Another subscriber may already be installed by the host.
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .ok();

    INIT.set(()).ok();
    tracing::debug!(service = %cfg.service_name, "tracing initialised");
    Ok(())
}

/// Records widget identity on a span declared with matching empty fields.
pub fn with_widget_fields(span: &Span, workspace_id: &str, session_id: Option<&str>) {
    span.record("workspace_id", tracing::field::display(workspace_id));
    if let Some(session_id) = session_id {
        span.record("session_id", tracing::field::display(session_id));
    }
}
