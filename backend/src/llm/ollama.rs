//! Ollama backend client.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::{BackendError, ByteStream, GenerateRequest, GenerationBackend};
use crate::config::OllamaConfig;

/// Client for the Ollama HTTP API.
pub struct OllamaBackend {
    http_client: Client,
    base_url: String,
    keep_alive: String,
}

/// Minimal generate call used to force a model into memory.
#[derive(Debug, Serialize)]
struct WarmUpRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    keep_alive: &'a str,
    options: WarmUpOptions,
}

#[derive(Debug, Serialize)]
struct WarmUpOptions {
    num_predict: u32,
}

/// Response from /api/tags endpoint.
#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaModelInfo>,
}

#[derive(Debug, Deserialize)]
struct OllamaModelInfo {
    name: String,
}

impl OllamaBackend {
    pub fn new(config: &OllamaConfig) -> Result<Self, BackendError> {
        let http_client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| BackendError::Client(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            keep_alive: config.keep_alive.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn send_error(&self, e: reqwest::Error) -> BackendError {
        if e.is_connect() {
            BackendError::Unavailable(self.base_url.clone())
        } else if e.is_timeout() {
            BackendError::Stream(format!("request to {} timed out", self.base_url))
        } else {
            BackendError::Client(e.to_string())
        }
    }

    async fn status_error(response: reqwest::Response, model: Option<&str>) -> BackendError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match (status, model) {
            (StatusCode::NOT_FOUND, Some(model)) => BackendError::ModelNotFound(model.to_string()),
            _ => BackendError::Status {
                status: status.as_u16(),
                body,
            },
        }
    }
}

#[async_trait]
impl GenerationBackend for OllamaBackend {
    fn backend_type(&self) -> &'static str {
        "ollama"
    }

    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;

        if !response.status().is_success() {
            return Err(Self::status_error(response, None).await);
        }

        let tags: OllamaTagsResponse = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    async fn warm_up(&self, model: &str) -> Result<(), BackendError> {
        let url = format!("{}/api/generate", self.base_url);
        let request = WarmUpRequest {
            model,
            prompt: "",
            stream: false,
            keep_alive: &self.keep_alive,
            options: WarmUpOptions { num_predict: 1 },
        };

        tracing::debug!("Warming up model {} via {}", model, url);

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;

        if !response.status().is_success() {
            return Err(Self::status_error(response, Some(model)).await);
        }

        // Drain the body so the call only counts as done once Ollama is.
        response
            .bytes()
            .await
            .map_err(|e| BackendError::Stream(e.to_string()))?;

        Ok(())
    }

    async fn generate_stream(&self, request: &GenerateRequest) -> Result<ByteStream, BackendError> {
        let url = format!("{}/api/generate", self.base_url);

        tracing::debug!("Opening generate stream: {} model={}", url, request.model);

        let response = self
            .http_client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;

        if !response.status().is_success() {
            return Err(Self::status_error(response, Some(&request.model)).await);
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| BackendError::Stream(e.to_string())))
            .boxed())
    }
}
