//! Text-generation backend abstraction.
//!
//! The gateway talks to exactly one backend. The `GenerationBackend` trait is
//! the seam between the gateway components and the HTTP client, so the
//! residency cache, directory and proxy can run against a fake in tests.

mod ollama;

pub use ollama::OllamaBackend;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::Serialize;

use crate::config::GenerationOptions;

/// Raw body of a streaming generate call, as network chunks.
///
/// Lazy, finite and non-restartable. A read failure is yielded as an `Err`
/// item; the end of the stream is the success signal.
pub type ByteStream = BoxStream<'static, Result<Bytes, BackendError>>;

/// Body of a generate call.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub stream: bool,
    pub options: GenerationOptions,
}

impl GenerateRequest {
    pub fn streaming(model: &str, prompt: &str, options: GenerationOptions) -> Self {
        Self {
            model: model.to_string(),
            prompt: prompt.to_string(),
            stream: true,
            options,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("Backend is not reachable at {0} (is `ollama serve` running?)")]
    Unavailable(String),
    #[error("Model '{0}' not found. Run: ollama pull {0}")]
    ModelNotFound(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Streaming error: {0}")]
    Stream(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("HTTP client error: {0}")]
    Client(String),
}

impl BackendError {
    pub fn is_model_not_found(&self) -> bool {
        matches!(self, BackendError::ModelNotFound(_))
    }
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Short identifier used in logs and the status endpoint.
    fn backend_type(&self) -> &'static str;

    /// Names of the models the backend currently knows about, in backend order.
    async fn list_models(&self) -> Result<Vec<String>, BackendError>;

    /// Issue a minimal generation so the backend loads `model` into memory.
    async fn warm_up(&self, model: &str) -> Result<(), BackendError>;

    /// Open a streaming generate call. Errors here are connection or HTTP
    /// status failures; errors while reading come through the stream.
    async fn generate_stream(&self, request: &GenerateRequest) -> Result<ByteStream, BackendError>;

    /// Check that the backend answers at all.
    async fn health_check(&self) -> Result<(), BackendError> {
        self.list_models().await.map(|_| ())
    }
}
