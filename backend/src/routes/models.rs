//! Model listing endpoint.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::{Deserialize, Serialize};

use crate::AppState;

/// Response from /api/models endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub models: Vec<String>,
    /// Model used when a client names none or an unknown one.
    pub default: Option<String>,
}

/// GET /api/models - List models the backend can serve
async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    let models = state.directory.list_models().await;
    let default = state.directory.default_model(&models);

    Json(ModelsResponse { models, default })
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/models", get(list_models))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_models_response_serialization() {
        let response = ModelsResponse {
            models: vec!["sofiaai_gmm_v3:latest".to_string()],
            default: None,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert_eq!(json, r#"{"models":["sofiaai_gmm_v3:latest"],"default":null}"#);
    }
}
