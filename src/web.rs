//! HTTP surface of the controller daemon: health and Prometheus metrics

use axum::{extract::State, routing::get, Json, Router};
use prometheus_client::registry::Registry;
use serde::Serialize;
use std::sync::Arc;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "hodei-run-controller".to_string(),
    })
}

async fn metrics(State(registry): State<Arc<Registry>>) -> String {
    let mut body = String::new();
    if let Err(err) = prometheus_client::encoding::text::encode(&mut body, &registry) {
        tracing::error!(error = %err, "Failed to encode metrics");
    }
    body
}

/// Serve /health and /metrics until the process exits
pub async fn start_server(port: u16, registry: Arc<Registry>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(registry);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "Serving health and metrics");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}
