//! The Hadron placement coordinator.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing_subscriber::prelude::*;

use hadron_placement::app::App;
use hadron_placement::config::Config;
use hadron_placement::get_metrics_recorder;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true)
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    let recorder = get_metrics_recorder(&cfg);
    metrics::set_recorder(recorder).context("error setting prometheus metrics recorder")?;

    tracing::info!(
        metrics_port = %cfg.metrics_port,
        node_name = %cfg.node_name,
        storage_data_path = %cfg.storage_data_path,
        channels = cfg.channels.len(),
        "starting Hadron placement coordinator",
    );
    let (shutdown_tx, _) = broadcast::channel(1);
    let res = App::new(cfg, shutdown_tx).await?.spawn().await.context("error joining app task").and_then(|res| res);
    if let Err(err) = res {
        tracing::error!(error = ?err);
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
