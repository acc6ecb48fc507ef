use crate::SharedMetrics;
use anyhow::{Error as AnyhowError, Result};
use axum::{Router, extract::State, http::StatusCode, routing::get};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct MetricsServerConfig {
    pub metrics_address: IpAddr,
    pub metrics_port: u16,
}

impl From<&MetricsServerConfig> for SocketAddr {
    fn from(config: &MetricsServerConfig) -> Self {
        SocketAddr::from((config.metrics_address, config.metrics_port))
    }
}

async fn prometheus_metrics_handler(
    State(metrics): State<SharedMetrics>,
) -> Result<String, StatusCode> {
    metrics.gather().map_err(|err| {
        warn!(%err, "Failed to encode metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

fn router(metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/metrics", get(prometheus_metrics_handler))
        .with_state(metrics)
}

/// Serves `/metrics` until `shutdown` resolves.
pub async fn run_metrics_server<F>(
    config: MetricsServerConfig,
    metrics: SharedMetrics,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = SocketAddr::from(&config);
    let listener = TcpListener::bind(&addr).await?;
    serve_metrics(listener, metrics, shutdown).await
}

pub async fn serve_metrics<F>(listener: TcpListener, metrics: SharedMetrics, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(address = ?listener.local_addr()?, "Metrics server listening");

    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(AnyhowError::new)?;

    info!("Metrics server stopped");
    Ok(())
}
