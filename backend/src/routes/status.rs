//! Service index and gateway status.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::gateway::ResidencyStats;
use crate::AppState;

#[derive(Debug, Serialize)]
struct Endpoints {
    websocket: &'static str,
    health: &'static str,
    metrics: &'static str,
    status: &'static str,
    models: &'static str,
}

#[derive(Debug, Serialize)]
struct IndexResponse {
    service: &'static str,
    status: &'static str,
    version: &'static str,
    endpoints: Endpoints,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub backend: &'static str,
    pub backend_type: &'static str,
    pub models: Vec<String>,
    pub default_model: Option<String>,
    /// When the model list was last fetched from the backend; `None` if never.
    pub directory_fetched_at: Option<DateTime<Utc>>,
    pub residency: ResidencyStats,
    pub connections: usize,
}

/// GET / - Service name and endpoint map
async fn index() -> Json<IndexResponse> {
    Json(IndexResponse {
        service: "SofiaAI Streaming Gateway",
        status: "online",
        version: env!("CARGO_PKG_VERSION"),
        endpoints: Endpoints {
            websocket: "/ws",
            health: "/health",
            metrics: "/metrics",
            status: "/api/status",
            models: "/api/models",
        },
    })
}

/// GET /api/status - Backend reachability, models, residency and connections
async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let backend = match state.backend.health_check().await {
        Ok(()) => "connected",
        Err(e) => {
            tracing::debug!("Backend health check failed: {}", e);
            "disconnected"
        }
    };
    let models = state.directory.list_models().await;
    let default_model = state.directory.default_model(&models);
    let directory_fetched_at = state.directory.snapshot().await.map(|s| s.captured_at);

    Json(StatusResponse {
        status: "online",
        backend,
        backend_type: state.backend.backend_type(),
        models,
        default_model,
        directory_fetched_at,
        residency: state.residency.stats().await,
        connections: state.connections.connection_count().await,
    })
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/status", get(status))
        .with_state(state)
}
