use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use sofia_backend::{logging, routes, AppState, Config, GenerationBackend, OllamaBackend};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize tracing
    logging::init(&config.logging.level);

    tracing::info!("Starting SofiaAI streaming gateway");

    let backend = OllamaBackend::new(&config.ollama)?;
    tracing::info!("Using Ollama at {}", backend.base_url());

    match backend.list_models().await {
        Ok(models) if models.is_empty() => {
            tracing::warn!("Ollama reports no models; pull one before connecting clients")
        }
        Ok(models) => tracing::info!("Models available: {}", models.join(", ")),
        Err(e) => tracing::warn!("Could not list models at startup: {}", e),
    }

    let state = Arc::new(AppState::new(config.clone(), Arc::new(backend)));

    // Liveness sweep over WebSocket clients
    let interval = Duration::from_secs(config.liveness.interval_secs.max(1));
    tokio::spawn(state.connections.clone().run_liveness(interval));

    let app = routes::router(state);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {} (WebSocket at /ws)", listener.local_addr()?);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
