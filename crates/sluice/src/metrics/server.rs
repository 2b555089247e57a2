//! HTTP endpoint for process inspection
//!
//! Serves the registry as JSON at `/debug/vars` plus a `/healthz` probe.
//! Not part of the compute semantics; jobs that want their counters visible
//! spawn this next to the pipeline.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

use super::registry::MetricsRegistry;
use crate::error::Result;

/// Configuration for the inspection endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsServerConfig {
    /// Bind address
    pub bind_address: String,

    /// Port; 0 lets the OS pick
    pub port: u16,
}

impl Default for MetricsServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 9182,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HealthStatus {
    status: String,
    version: String,
}

async fn vars(State(registry): State<Arc<MetricsRegistry>>) -> Json<serde_json::Value> {
    Json(registry.snapshot())
}

async fn healthz() -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Serve the global registry until the task is dropped. Returns once the
/// listener is bound and serving; the returned address carries the actual
/// port when configured with 0.
pub async fn serve_metrics(config: MetricsServerConfig) -> Result<SocketAddr> {
    let registry = MetricsRegistry::global();
    let app = Router::new()
        .route("/debug/vars", get(vars))
        .route("/healthz", get(healthz))
        .with_state(registry);

    let listener = TcpListener::bind((config.bind_address.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;
    info!(%addr, "metrics endpoint listening");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(%err, "metrics endpoint terminated");
        }
    });
    Ok(addr)
}
