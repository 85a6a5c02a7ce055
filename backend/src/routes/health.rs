use std::fmt::Write;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::gateway::ResidencyStats;
use crate::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let connections = state.connections.connection_count().await;
    let residency = state.residency.stats().await;
    let body = render_metrics(connections, &residency);
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

/// Prometheus text exposition of the gateway gauges and counters.
fn render_metrics(connections: usize, residency: &ResidencyStats) -> String {
    let mut body = format!(
        "# HELP sofia_up Whether the service is up\n\
         # TYPE sofia_up gauge\n\
         sofia_up 1\n\
         # HELP sofia_info Service information\n\
         # TYPE sofia_info gauge\n\
         sofia_info{{version=\"{}\"}} 1\n\
         # HELP sofia_connections Open WebSocket connections\n\
         # TYPE sofia_connections gauge\n\
         sofia_connections {}\n",
        env!("CARGO_PKG_VERSION"),
        connections
    );

    body.push_str(
        "# HELP sofia_model_loads_total Completed model warm-ups\n\
         # TYPE sofia_model_loads_total counter\n",
    );
    for (model, count) in &residency.load_counts {
        let _ = writeln!(body, "sofia_model_loads_total{{model=\"{}\"}} {}", model, count);
    }

    body.push_str(
        "# HELP sofia_model_resident Whether a model is currently warm\n\
         # TYPE sofia_model_resident gauge\n",
    );
    for model in &residency.resident {
        let _ = writeln!(body, "sofia_model_resident{{model=\"{}\"}} 1", model);
    }

    body
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}
