//! Prometheus scrape endpoint.
use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result};
use axum::{Router, extract::State, routing::get};
use tokio::net::TcpListener;
use tracing::info;

use crate::SharedMetrics;

#[derive(Clone, Debug)]
pub struct MetricsServerConfig {
    pub metrics_address: IpAddr,
    pub metrics_port: u16,
}

impl MetricsServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.metrics_address, self.metrics_port)
    }
}

async fn scrape(State(metrics): State<SharedMetrics>) -> String {
    metrics.gather()
}

fn router(metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/metrics", get(scrape))
        .with_state(metrics)
}

pub async fn run_metrics_server(config: MetricsServerConfig, metrics: SharedMetrics) -> Result<()> {
    let addr = config.socket_addr();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics server to {addr}"))?;
    serve(listener, metrics).await
}

/// Serve `/metrics` on an already bound listener.
pub async fn serve(listener: TcpListener, metrics: SharedMetrics) -> Result<()> {
    info!(addr = %listener.local_addr()?, "Metrics server listening");
    axum::serve(listener, router(metrics))
        .await
        .context("metrics server stopped")
}
