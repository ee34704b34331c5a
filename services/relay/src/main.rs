//! tcprelay
//!
//! Relays every TCP connection accepted on the bind address to a single
//! destination until SIGINT/SIGTERM, then shuts down in order: stop
//! accepting, close every live relay, exit.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use tcprelay::config::Config;
use tcprelay::{logging, Pipeline, ProxyController, TransformHook};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    logging::init(&config.log_level, config.log_format)?;

    info!("Starting tcprelay");

    let mut settings = config.proxy_settings();
    if let Some(path) = &config.transform {
        let pipeline = Pipeline::load(path)
            .with_context(|| format!("loading transform pipeline {}", path.display()))?;
        info!(path = %path.display(), stages = pipeline.len(), "Transform pipeline loaded");
        settings = settings.with_hook(Arc::new(pipeline) as Arc<dyn TransformHook>);
    }

    let bind = config.bind_address()?;
    let destination = config.destination()?;
    info!(
        bind = %bind,
        destination = %destination,
        accept_interval_ms = settings.accept_interval.as_millis() as u64,
        connect_timeout_ms = settings.connect_timeout.as_millis() as u64,
        "Configuration loaded"
    );

    let controller = Arc::new(ProxyController::new(settings));
    controller.start(bind, destination).await?;

    wait_for_signal().await?;
    info!("Received shutdown signal");

    controller.shutdown().await;
    controller.wait_stopped().await;

    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl+C handler")
}
