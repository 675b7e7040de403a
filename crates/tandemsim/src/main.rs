//! Simulated session between a frontend map view and a backend kernel.
//!
//! Both ends run in one process over a channel pair. Each side announces its
//! protocol, waits for the other's, and then they call each other:
//!
//!   RUST_LOG=debug cargo run -p tandemsim
//!
//! `TANDEM_CALL_TIMEOUT_MS` bounds how long a call may stay unanswered.

mod services;

use std::sync::Arc;

use serde_json::json;
use tracing_subscriber::EnvFilter;

use tandemrun::Args;
use tandemrun::ChannelTransport;
use tandemrun::Router;
use tandemrun::RouterConfig;

use crate::services::Kernel;
use crate::services::Map;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RouterConfig::from_env()?;
    let (back, front) = ChannelTransport::pair();

    let backend = Arc::new(
        Router::builder()
            .config(config.clone())
            .expose(Arc::new(Kernel::default()))
            .build(back.clone())?,
    );
    let frontend = Arc::new(
        Router::builder()
            .config(config)
            .expose(Arc::new(Map::default()))
            .build(front.clone())?,
    );

    let backend_pump = backend.serve(back);
    let frontend_pump = frontend.serve(front);

    backend.announce()?;
    frontend.announce()?;

    let map = backend.wait_for_remote().await;
    let kernel = frontend.wait_for_remote().await;
    tracing::info!(
        map = ?map.protocol().names().collect::<Vec<_>>(),
        kernel = ?kernel.protocol().names().collect::<Vec<_>>(),
        "session established",
    );

    // backend drives the view
    map.call("set_center", Args::new().arg(-122.4).arg(37.8).arg(12.0))?.await?;
    map.call("add_layer", Args::new().arg("osm").arg("http://tiles.local/osm"))?.await?;
    let layers = map
        .call("add_layer", Args::new().arg("ndvi").arg("http://tiles.local/ndvi").kwarg("opacity", 0.6))?
        .await?;
    tracing::info!(%layers, "layers on map");

    // frontend reports what the user drew
    let index = kernel
        .call("add_annotation", Args::new().arg("point").arg(json!([-122.4, 37.8])))?
        .await?;
    kernel.notify(
        "add_annotation",
        Args::new().arg("line").arg(json!([[0.0, 0.0], [1.0, 1.0]])).kwarg("meta", json!({"color": "red"})),
    )?;
    tracing::info!(%index, "annotation stored");

    match map.call("remove_layer", Args::new().arg("terrain"))?.await {
        Ok(_) => tracing::warn!("removed a layer that was never added"),
        Err(e) => tracing::info!(error = %e, "remote rejected the call"),
    }

    if let Err(e) = map.call("set_center", Args::new().arg(0.0)) {
        tracing::info!(error = %e, "call rejected before sending");
    }

    let state = map.call("get_state", Args::new())?.await?;
    let annotations = kernel.call("annotations", Args::new())?.await?;
    tracing::info!(%state, "final map state");
    tracing::info!(%annotations, "final annotations");

    backend_pump.abort();
    frontend_pump.abort();
    Ok(())
}
