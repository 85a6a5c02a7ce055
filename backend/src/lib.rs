pub mod codec;
pub mod config;
pub mod gateway;
pub mod llm;
pub mod logging;
pub mod routes;
pub mod test_util;

pub use config::Config;
pub use gateway::{ConnectionManager, GenerationProxy, ModelDirectory, ResidencyCache};
pub use llm::{BackendError, GenerationBackend, OllamaBackend};

use std::sync::Arc;
use std::time::Duration;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub backend: Arc<dyn GenerationBackend>,
    /// TTL-cached list of backend models.
    pub directory: Arc<ModelDirectory>,
    /// Which models are warm, with deduplicated loading.
    pub residency: Arc<ResidencyCache>,
    /// Live WebSocket clients.
    pub connections: Arc<ConnectionManager>,
}

impl AppState {
    /// Wire the gateway components around one backend.
    pub fn new(config: Config, backend: Arc<dyn GenerationBackend>) -> Self {
        let directory = Arc::new(ModelDirectory::new(
            backend.clone(),
            Duration::from_secs(config.models.directory_ttl_secs),
            config.models.default.clone(),
        ));
        let residency = Arc::new(ResidencyCache::new(backend.clone()));
        let proxy = Arc::new(GenerationProxy::new(
            backend.clone(),
            residency.clone(),
            config.generation.clone(),
        ));
        let connections = Arc::new(ConnectionManager::new(
            directory.clone(),
            residency.clone(),
            proxy,
            config.server.welcome_message.clone(),
        ));

        Self {
            config,
            backend,
            directory,
            residency,
            connections,
        }
    }
}
