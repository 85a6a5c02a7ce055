//! Live client connections: registry, session guard, request dispatch and liveness.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use sofia_common::{ClientRequest, ServerFrame};

use super::directory::ModelDirectory;
use super::proxy::{FrameSink, GenerationOutcome, GenerationProxy};
use super::residency::ResidencyCache;
use super::session::SessionId;
use crate::llm::BackendError;

pub type ConnectionId = Uuid;

/// Frames queued per connection before senders wait.
const OUTBOUND_CAPACITY: usize = 64;

/// Item on a connection's outbound queue.
#[derive(Debug)]
pub enum Outbound {
    Frame(ServerFrame),
    Ping,
}

/// Why an inbound request was turned down. `Display` is the client-facing text.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error("Prompt must not be empty")]
    EmptyPrompt,
    #[error("A generation is already in progress on this connection")]
    SessionActive,
    #[error("No models available on the backend")]
    NoModels,
    #[error("Failed to load model '{model}': {reason}")]
    LoadFailed { model: String, reason: BackendError },
    #[error("Connection closed")]
    Closed,
}

struct Connection {
    tx: mpsc::Sender<Outbound>,
    kill: Arc<Notify>,
    awaiting_pong: bool,
    active_session: Option<SessionId>,
    connected_at: DateTime<Utc>,
    peer: Option<SocketAddr>,
}

/// Receiving side of a registered connection, owned by its socket task.
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub outbound: mpsc::Receiver<Outbound>,
    /// Notified when the liveness sweep gives up on the connection.
    pub kill: Arc<Notify>,
}

pub struct ConnectionManager {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    directory: Arc<ModelDirectory>,
    residency: Arc<ResidencyCache>,
    proxy: Arc<GenerationProxy>,
    welcome_message: String,
}

impl ConnectionManager {
    pub fn new(
        directory: Arc<ModelDirectory>,
        residency: Arc<ResidencyCache>,
        proxy: Arc<GenerationProxy>,
        welcome_message: String,
    ) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            directory,
            residency,
            proxy,
            welcome_message,
        }
    }

    /// Register a new connection and queue its welcome frame.
    pub async fn register(&self, peer: Option<SocketAddr>) -> ConnectionHandle {
        let id = Uuid::new_v4();
        let (tx, outbound) = mpsc::channel(OUTBOUND_CAPACITY);
        let kill = Arc::new(Notify::new());

        let _ = tx.try_send(Outbound::Frame(ServerFrame::info(self.welcome_message.clone())));

        let connection = Connection {
            tx,
            kill: kill.clone(),
            awaiting_pong: false,
            active_session: None,
            connected_at: Utc::now(),
            peer,
        };
        self.connections.write().await.insert(id, connection);

        tracing::info!(connection_id = %id, "Client connected from {}", describe_peer(peer));

        ConnectionHandle { id, outbound, kill }
    }

    /// Drop a connection and whatever session it had.
    pub async fn unregister(&self, id: ConnectionId) {
        let Some(connection) = self.connections.write().await.remove(&id) else {
            return;
        };

        let seconds = (Utc::now() - connection.connected_at).num_seconds();
        match connection.active_session {
            Some(session_id) => tracing::info!(
                connection_id = %id,
                session_id = %session_id,
                "Client {} disconnected after {}s mid-generation",
                describe_peer(connection.peer),
                seconds
            ),
            None => tracing::info!(
                connection_id = %id,
                "Client {} disconnected after {}s",
                describe_peer(connection.peer),
                seconds
            ),
        }
    }

    /// Record a pong.
    pub async fn mark_alive(&self, id: ConnectionId) {
        if let Some(connection) = self.connections.write().await.get_mut(&id) {
            connection.awaiting_pong = false;
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Handle one inbound text frame.
    ///
    /// Validation and the session claim happen here, in order, so a second
    /// request sees the first one's claim. The rest of the request runs in
    /// its own task.
    pub async fn handle_text(self: &Arc<Self>, id: ConnectionId, text: &str) {
        let request = match parse_request(text) {
            Ok(request) => request,
            Err(e) => return self.reject(id, &e).await,
        };

        let session_id = match self.claim_session(id).await {
            Ok(session_id) => session_id,
            Err(e) => return self.reject(id, &e).await,
        };

        tracing::debug!(
            connection_id = %id,
            session_id = %session_id,
            "Accepted prompt ({} chars, requested model {:?})",
            request.prompt.chars().count(),
            request.modelo
        );

        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_session(id, session_id, request).await;
        });
    }

    /// Terminate connections that missed the previous ping and ping the rest.
    ///
    /// Returns the ids of the terminated connections.
    pub async fn sweep(&self) -> Vec<ConnectionId> {
        let mut terminated = Vec::new();
        let mut connections = self.connections.write().await;

        connections.retain(|id, connection| {
            if connection.awaiting_pong {
                connection.kill.notify_one();
                terminated.push(*id);
                return false;
            }
            connection.awaiting_pong = true;
            if let Err(e) = connection.tx.try_send(Outbound::Ping) {
                tracing::debug!(connection_id = %id, "Could not queue ping: {}", e);
            }
            true
        });

        for id in &terminated {
            tracing::warn!(connection_id = %id, "Terminating unresponsive connection");
        }
        terminated
    }

    /// Run the liveness sweep forever at `interval`.
    pub async fn run_liveness(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let terminated = self.sweep().await;
            if !terminated.is_empty() {
                tracing::info!("Liveness sweep terminated {} connections", terminated.len());
            }
        }
    }

    async fn claim_session(&self, id: ConnectionId) -> Result<SessionId, RequestError> {
        let mut connections = self.connections.write().await;
        let connection = connections.get_mut(&id).ok_or(RequestError::Closed)?;
        if connection.active_session.is_some() {
            return Err(RequestError::SessionActive);
        }
        let session_id = Uuid::new_v4();
        connection.active_session = Some(session_id);
        Ok(session_id)
    }

    async fn release_session(&self, id: ConnectionId, session_id: SessionId) {
        if let Some(connection) = self.connections.write().await.get_mut(&id) {
            if connection.active_session == Some(session_id) {
                connection.active_session = None;
            }
        }
    }

    /// Send a rejection without waiting for queue space.
    ///
    /// Called from the socket task itself, which is also the one draining
    /// the queue.
    async fn reject(&self, id: ConnectionId, error: &RequestError) {
        tracing::debug!(connection_id = %id, "Rejecting request: {}", error);
        let connections = self.connections.read().await;
        if let Some(connection) = connections.get(&id) {
            let frame = ServerFrame::error(error.to_string());
            if let Err(e) = connection.tx.try_send(Outbound::Frame(frame)) {
                tracing::warn!(connection_id = %id, "Dropped rejection frame: {}", e);
            }
        }
    }

    async fn sender(&self, id: ConnectionId) -> Option<mpsc::Sender<Outbound>> {
        self.connections.read().await.get(&id).map(|c| c.tx.clone())
    }

    async fn run_session(self: Arc<Self>, id: ConnectionId, session_id: SessionId, request: ClientRequest) {
        let Some(tx) = self.sender(id).await else {
            return;
        };
        let sink = SessionSink {
            manager: self.clone(),
            connection_id: id,
            session_id,
            tx,
        };

        let outcome = match self.prepare(&request).await {
            Ok(model) => {
                self.proxy
                    .generate(session_id, &model, &request.prompt, &sink)
                    .await
            }
            Err(e) => {
                tracing::warn!(connection_id = %id, session_id = %session_id, "Request failed: {}", e);
                sink.send_frame(ServerFrame::error(e.to_string())).await;
                GenerationOutcome::Failed(e.to_string())
            }
        };

        // Terminal frames release the slot already; this covers cancellation.
        self.release_session(id, session_id).await;
        tracing::debug!(connection_id = %id, session_id = %session_id, "Session ended: {:?}", outcome);
    }

    /// Pick the model and make sure it is resident.
    async fn prepare(&self, request: &ClientRequest) -> Result<String, RequestError> {
        let models = self.directory.list_models().await;
        let model = self
            .directory
            .resolve(request.modelo.as_deref(), &models)
            .ok_or(RequestError::NoModels)?;

        if !self.residency.is_resident(&model).await {
            tracing::debug!(model = %model, "Model is not resident, warming up before generating");
        }
        if let Err(reason) = self.residency.load(&model).await {
            return Err(RequestError::LoadFailed { model, reason });
        }
        Ok(model)
    }
}

fn parse_request(text: &str) -> Result<ClientRequest, RequestError> {
    let request: ClientRequest =
        serde_json::from_str(text).map_err(|e| RequestError::InvalidMessage(e.to_string()))?;
    if request.is_blank() {
        return Err(RequestError::EmptyPrompt);
    }
    Ok(request)
}

fn describe_peer(peer: Option<SocketAddr>) -> String {
    peer.map(|p| p.to_string()).unwrap_or_else(|| "unknown".to_string())
}

/// Frame sink of one session. Frees the session slot before the terminal
/// frame goes out, so the client can send its next prompt as soon as it
/// sees `done` or `error`.
struct SessionSink {
    manager: Arc<ConnectionManager>,
    connection_id: ConnectionId,
    session_id: SessionId,
    tx: mpsc::Sender<Outbound>,
}

#[async_trait]
impl FrameSink for SessionSink {
    async fn send_frame(&self, frame: ServerFrame) -> bool {
        if frame.is_terminal() {
            self.manager
                .release_session(self.connection_id, self.session_id)
                .await;
        }
        self.tx.send(Outbound::Frame(frame)).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{test_state, FakeBackend};

    fn manager_for(backend: Arc<FakeBackend>) -> Arc<ConnectionManager> {
        test_state(backend).connections.clone()
    }

    async fn next_frame(handle: &mut ConnectionHandle) -> ServerFrame {
        loop {
            let item = tokio::time::timeout(Duration::from_secs(5), handle.outbound.recv())
                .await
                .expect("timed out waiting for a frame")
                .expect("outbound queue closed");
            if let Outbound::Frame(frame) = item {
                return frame;
            }
        }
    }

    /// Frames up to and including the first `done`.
    async fn until_done(handle: &mut ConnectionHandle) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        loop {
            let frame = next_frame(handle).await;
            let done = matches!(frame, ServerFrame::Done { .. });
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }

    async fn connect(manager: &Arc<ConnectionManager>) -> ConnectionHandle {
        let mut handle = manager.register(None).await;
        assert!(matches!(next_frame(&mut handle).await, ServerFrame::Info { .. }));
        handle
    }

    #[tokio::test]
    async fn test_register_queues_welcome() {
        let manager = manager_for(Arc::new(FakeBackend::new(&["m"])));
        let mut handle = manager.register(None).await;

        assert_eq!(
            next_frame(&mut handle).await,
            ServerFrame::info("Connected to the SofiaAI WebSocket server!")
        );
        assert_eq!(manager.connection_count().await, 1);

        manager.unregister(handle.id).await;
        assert_eq!(manager.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_model_falls_back_to_default() {
        let manager = manager_for(Arc::new(FakeBackend::new(&["modelB"])));
        let mut handle = connect(&manager).await;

        manager
            .handle_text(handle.id, r#"{"prompt":"hi","modelo":"modelA"}"#)
            .await;
        let frames = until_done(&mut handle).await;

        assert_eq!(frames[0], ServerFrame::Start { model: "modelB".to_string() });
        assert!(frames.iter().any(|f| f.kind() == "token"));
        assert!(frames.iter().all(|f| f.kind() != "error"));
    }

    #[tokio::test]
    async fn test_model_alias_is_honored() {
        let manager = manager_for(Arc::new(FakeBackend::new(&["a", "b"])));
        let mut handle = connect(&manager).await;

        manager.handle_text(handle.id, r#"{"prompt":"hi","model":"b"}"#).await;
        let frames = until_done(&mut handle).await;

        assert_eq!(frames[0], ServerFrame::Start { model: "b".to_string() });
    }

    #[tokio::test]
    async fn test_empty_prompt_keeps_connection_usable() {
        let manager = manager_for(Arc::new(FakeBackend::new(&["m"])));
        let mut handle = connect(&manager).await;

        manager.handle_text(handle.id, r#"{"prompt":"   "}"#).await;
        assert_eq!(next_frame(&mut handle).await, ServerFrame::error("Prompt must not be empty"));

        manager.handle_text(handle.id, r#"{"prompt":"hi"}"#).await;
        let frames = until_done(&mut handle).await;
        assert_eq!(frames[0].kind(), "start");
    }

    #[tokio::test]
    async fn test_invalid_json_is_rejected() {
        let manager = manager_for(Arc::new(FakeBackend::new(&["m"])));
        let mut handle = connect(&manager).await;

        manager.handle_text(handle.id, "not json").await;

        match next_frame(&mut handle).await {
            ServerFrame::Error { message } => assert!(message.starts_with("Invalid message")),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_second_request_rejected_while_generating() {
        let backend = Arc::new(FakeBackend::new(&["m"]));
        backend.set_tokens(&["a", "b", "c"], 16);
        backend.set_chunk_delay(Duration::from_millis(20));
        let manager = manager_for(backend.clone());
        let mut handle = connect(&manager).await;

        manager.handle_text(handle.id, r#"{"prompt":"first"}"#).await;
        manager.handle_text(handle.id, r#"{"prompt":"second"}"#).await;
        let frames = until_done(&mut handle).await;

        let errors: Vec<_> = frames.iter().filter(|f| f.kind() == "error").collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            *errors[0],
            ServerFrame::error("A generation is already in progress on this connection")
        );
        assert_eq!(frames.iter().filter(|f| f.kind() == "start").count(), 1);
        assert_eq!(backend.generate_calls(), 1);
        assert_eq!(backend.last_request().unwrap().prompt, "first");

        // The slot is free again as soon as `done` is out.
        manager.handle_text(handle.id, r#"{"prompt":"third"}"#).await;
        let frames = until_done(&mut handle).await;
        assert_eq!(frames[0].kind(), "start");
    }

    #[tokio::test]
    async fn test_empty_directory_reports_error_and_releases_slot() {
        let manager = manager_for(Arc::new(FakeBackend::new(&[])));
        let mut handle = connect(&manager).await;

        for _ in 0..2 {
            manager.handle_text(handle.id, r#"{"prompt":"hi"}"#).await;
            assert_eq!(
                next_frame(&mut handle).await,
                ServerFrame::error("No models available on the backend")
            );
        }
    }

    #[tokio::test]
    async fn test_failed_warm_up_reports_error() {
        let backend = Arc::new(FakeBackend::new(&["m"]));
        backend.fail_warm_up("m");
        let manager = manager_for(backend.clone());
        let mut handle = connect(&manager).await;

        manager.handle_text(handle.id, r#"{"prompt":"hi"}"#).await;

        assert_eq!(
            next_frame(&mut handle).await,
            ServerFrame::error("Failed to load model 'm': Model 'm' not found. Run: ollama pull m")
        );
        assert_eq!(backend.generate_calls(), 0);
    }

    #[tokio::test]
    async fn test_warm_up_failure_reaches_every_waiting_client() {
        let backend = Arc::new(FakeBackend::new(&["m"]));
        backend.fail_warm_up("m");
        backend.set_warm_up_delay(Duration::from_millis(50));
        let manager = manager_for(backend.clone());
        let mut first = connect(&manager).await;
        let mut second = connect(&manager).await;

        manager.handle_text(first.id, r#"{"prompt":"hi"}"#).await;
        manager.handle_text(second.id, r#"{"prompt":"hi"}"#).await;

        for handle in [&mut first, &mut second] {
            match next_frame(handle).await {
                ServerFrame::Error { message } => assert!(message.contains("Run: ollama pull m")),
                other => panic!("expected error, got {:?}", other),
            }
        }
        assert_eq!(backend.warm_up_calls(), 1);
    }

    #[tokio::test]
    async fn test_pong_keeps_connection_alive() {
        let manager = manager_for(Arc::new(FakeBackend::new(&["m"])));
        let mut handle = connect(&manager).await;

        for _ in 0..3 {
            assert!(manager.sweep().await.is_empty());
            assert!(matches!(handle.outbound.recv().await, Some(Outbound::Ping)));
            manager.mark_alive(handle.id).await;
        }
        assert_eq!(manager.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_two_missed_pings_terminate() {
        let manager = manager_for(Arc::new(FakeBackend::new(&["m"])));
        let handle = connect(&manager).await;

        assert!(manager.sweep().await.is_empty());
        assert_eq!(manager.sweep().await, vec![handle.id]);

        assert_eq!(manager.connection_count().await, 0);
        tokio::time::timeout(Duration::from_secs(1), handle.kill.notified())
            .await
            .expect("kill signal not delivered");
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_task_terminates_silent_clients() {
        let manager = manager_for(Arc::new(FakeBackend::new(&["m"])));
        let handle = connect(&manager).await;
        tokio::spawn(manager.clone().run_liveness(Duration::from_secs(15)));

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(manager.connection_count().await, 1);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(manager.connection_count().await, 0);
        handle.kill.notified().await;
    }

    #[tokio::test]
    async fn test_closed_connection_abandons_generation() {
        let backend = Arc::new(FakeBackend::new(&["m"]));
        backend.set_tokens(&["a", "b", "c", "d"], 8);
        backend.set_chunk_delay(Duration::from_millis(20));
        let manager = manager_for(backend.clone());
        let mut handle = connect(&manager).await;

        manager.handle_text(handle.id, r#"{"prompt":"hi"}"#).await;
        assert_eq!(next_frame(&mut handle).await.kind(), "start");

        manager.unregister(handle.id).await;
        drop(handle);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(manager.connection_count().await, 0);
        assert_eq!(backend.generate_calls(), 1);
    }
}
