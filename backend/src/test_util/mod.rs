pub mod mock_ollama;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};

use crate::config::Config;
use crate::llm::{BackendError, ByteStream, GenerateRequest, GenerationBackend};
use crate::AppState;

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.logging.level = "debug".to_string();
    config
}

/// Build shared state around a fake backend.
pub fn test_state(backend: Arc<FakeBackend>) -> Arc<AppState> {
    Arc::new(AppState::new(test_config(), backend))
}

/// What a generate call on [`FakeBackend`] does.
#[derive(Debug, Clone)]
pub enum GenerateScript {
    /// Stream these chunks, then end normally.
    Chunks(Vec<Vec<u8>>),
    /// Stream these chunks, then fail with a read error.
    FailAfter(Vec<Vec<u8>>, String),
    /// Refuse the call before any data.
    Reject(BackendError),
}

/// In-process backend with scripted behavior and call counters.
pub struct FakeBackend {
    models: Mutex<Option<Vec<String>>>,
    failing_warm_ups: Mutex<HashSet<String>>,
    script: Mutex<GenerateScript>,
    warm_up_delay: Mutex<Duration>,
    chunk_delay: Mutex<Duration>,
    list_calls: AtomicUsize,
    warm_up_calls: AtomicUsize,
    generate_calls: AtomicUsize,
    last_request: Mutex<Option<GenerateRequest>>,
}

impl FakeBackend {
    pub fn new(models: &[&str]) -> Self {
        Self {
            models: Mutex::new(Some(models.iter().map(|m| m.to_string()).collect())),
            failing_warm_ups: Mutex::new(HashSet::new()),
            script: Mutex::new(GenerateScript::Chunks(vec![
                mock_ollama::ndjson(&["Hello", ",", " world"]).into_bytes(),
            ])),
            warm_up_delay: Mutex::new(Duration::ZERO),
            chunk_delay: Mutex::new(Duration::ZERO),
            list_calls: AtomicUsize::new(0),
            warm_up_calls: AtomicUsize::new(0),
            generate_calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    /// Replace the model list. `None` makes `list_models` fail.
    pub fn set_models(&self, models: Option<&[&str]>) {
        *self.models.lock().unwrap() = models.map(|m| m.iter().map(|s| s.to_string()).collect());
    }

    pub fn fail_warm_up(&self, model: &str) {
        self.failing_warm_ups.lock().unwrap().insert(model.to_string());
    }

    pub fn allow_warm_up(&self, model: &str) {
        self.failing_warm_ups.lock().unwrap().remove(model);
    }

    pub fn set_script(&self, script: GenerateScript) {
        *self.script.lock().unwrap() = script;
    }

    /// Stream `tokens` as one NDJSON body split into `chunk_size` byte pieces.
    pub fn set_tokens(&self, tokens: &[&str], chunk_size: usize) {
        let body = mock_ollama::ndjson(tokens).into_bytes();
        let chunks = body.chunks(chunk_size.max(1)).map(<[u8]>::to_vec).collect();
        self.set_script(GenerateScript::Chunks(chunks));
    }

    pub fn set_warm_up_delay(&self, delay: Duration) {
        *self.warm_up_delay.lock().unwrap() = delay;
    }

    pub fn set_chunk_delay(&self, delay: Duration) {
        *self.chunk_delay.lock().unwrap() = delay;
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn warm_up_calls(&self) -> usize {
        self.warm_up_calls.load(Ordering::SeqCst)
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<GenerateRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationBackend for FakeBackend {
    fn backend_type(&self) -> &'static str {
        "fake"
    }

    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.models
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| BackendError::Unavailable("fake://backend".to_string()))
    }

    async fn warm_up(&self, model: &str) -> Result<(), BackendError> {
        self.warm_up_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.warm_up_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing_warm_ups.lock().unwrap().contains(model) {
            return Err(BackendError::ModelNotFound(model.to_string()));
        }
        Ok(())
    }

    async fn generate_stream(&self, request: &GenerateRequest) -> Result<ByteStream, BackendError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());

        let script = self.script.lock().unwrap().clone();
        let delay = *self.chunk_delay.lock().unwrap();

        let (chunks, failure) = match script {
            GenerateScript::Reject(e) => return Err(e),
            GenerateScript::Chunks(chunks) => (chunks, None),
            GenerateScript::FailAfter(chunks, message) => (chunks, Some(message)),
        };

        let items = chunks
            .into_iter()
            .map(|c| Ok(Bytes::from(c)))
            .chain(failure.map(|m| Err(BackendError::Stream(m))));

        Ok(stream::iter(items)
            .then(move |item| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                item
            })
            .boxed())
    }
}
