//! EasyWallbox Bluetooth LE to MQTT bridge.

use anyhow::{Context, Result};
use tracing::info;

use easywallbox_bridge::{Bridge, WallboxBridgeConfig};
use easywallbox_common::{BridgeArgs, BridgeConfig, init_tracing};

#[tokio::main]
async fn main() -> Result<()> {
    let args = BridgeArgs::parse_with_default("easywallbox.json5");

    let config = WallboxBridgeConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let mut logging = config.logging().clone();
    if let Some(level) = &args.log_level {
        logging.level = level.clone();
    }
    init_tracing(&logging).context("Failed to init tracing")?;

    info!(config = ?args.config, "Starting easywallbox-bridge");

    let bridge = Bridge::start(&config);

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    bridge.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
