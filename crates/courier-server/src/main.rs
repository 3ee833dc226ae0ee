//! # Courier Server
//!
//! Realtime chat and notification delivery server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! courier
//!
//! # Run with a config file in ./courier.toml or /etc/courier/courier.toml
//! courier
//!
//! # Override single settings from the environment
//! COURIER__PORT=8080 COURIER__BACKPLANE__TRANSPORTS=mesh courier
//! ```

use anyhow::Result;
use courier_server::{run_server, Config};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier_server=debug,courier_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    tracing::info!("Starting Courier server on {}:{}", config.host, config.port);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    run_server(config, shutdown).await
}
