//! Drives a widget connection over the in-memory transport:
//! connect, subscribe, drop the link, queue a message and recover.
//!
//! `RUST_LOG=debug cargo run -p widget-connector --example local_demo`

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{Instrument, field, info, info_span};
use widget_connector::{
    MemoryIdentityStore, UrlTokenProvider, WidgetConnection, WidgetDeps, WidgetOptions,
};
use widget_realtime::{MemoryTransport, RawTransportState, StaticTokenSource};

const CONVERSATION: &str = "widget:conversation:demo";

#[tokio::main]
async fn main() -> Result<()> {
    widget_telemetry::install("widget-local-demo")?;

    let span = info_span!("widget.demo", workspace_id = field::Empty, session_id = field::Empty);
    widget_telemetry::with_widget_fields(&span, "acme", Some("s-demo"));
    run().instrument(span).await
}

async fn run() -> Result<()> {
    let transport = MemoryTransport::new();
    let identity = Arc::new(MemoryIdentityStore::with_identity("demo-access", "s-demo"));
    let deps = WidgetDeps {
        transport: Arc::new(transport.clone()),
        token_source: Arc::new(StaticTokenSource::new("demo-capability")),
        token_provider: Arc::new(UrlTokenProvider::new("http://localhost:8080/api")?),
        identity,
    };
    let connection = WidgetConnection::new(deps, WidgetOptions::from_env("acme"))
        .with_status_callback(|status| info!(%status, "widget status"));

    connection.mount().await;
    let messenger = connection.messenger();
    messenger
        .subscribe(CONVERSATION, "message", |message| {
            info!(data = %message.data, "message received");
        })
        .await
        .context("subscribe after mount")?;

    let client = transport.latest_client().context("client connected")?;
    client.set_state(RawTransportState::Disconnected);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let outcome = messenger
        .publish(CONVERSATION, "message", json!({ "text": "sent while offline" }))
        .await;
    info!(?outcome, pending = connection.pending_messages(), "published during outage");

    client.set_state(RawTransportState::Connected);
    tokio::time::sleep(Duration::from_millis(50)).await;
    info!(pending = connection.pending_messages(), "link restored");

    connection.unmount().await;
    Ok(())
}
