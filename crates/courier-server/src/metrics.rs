//! Prometheus export.
//!
//! Instrumentation lives in `courier_core::metrics`; this module only
//! installs the recorder that serves it.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Start the Prometheus metrics listener and describe all metrics.
///
/// # Errors
///
/// Returns an error if the listener cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<SocketAddr> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("Failed to install Prometheus exporter on {addr}"))?;
    courier_core::metrics::describe();

    info!("Metrics server listening on {}", addr);
    Ok(addr)
}
