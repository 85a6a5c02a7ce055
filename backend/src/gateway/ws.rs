//! WebSocket handler for client connections.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};

use sofia_common::ServerFrame;

use super::connections::Outbound;
use crate::AppState;

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    tracing::debug!("WebSocket upgrade from {}", addr);
    ws.on_upgrade(move |socket| handle_client(socket, state, addr))
}

/// Drive one client connection until it closes or is terminated.
async fn handle_client(socket: WebSocket, state: Arc<AppState>, addr: SocketAddr) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let manager = state.connections.clone();
    let handle = manager.register(Some(addr)).await;
    let id = handle.id;
    let mut outbound = handle.outbound;
    let kill = handle.kill;

    loop {
        tokio::select! {
            // Liveness sweep gave up: drop the transport without a close frame.
            _ = kill.notified() => {
                tracing::warn!(connection_id = %id, "Dropping unresponsive client {}", addr);
                break;
            }

            // Outbound frames and pings
            Some(item) = outbound.recv() => {
                let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = match item {
                    Outbound::Frame(frame) => send_frame(&mut ws_tx, &frame).await,
                    Outbound::Ping => ws_tx.send(Message::Ping(Vec::new())).await.map_err(Into::into),
                };
                if let Err(e) = result {
                    tracing::error!(connection_id = %id, "Failed to send to {}: {}", addr, e);
                    break;
                }
            }

            // Inbound messages from the client
            inbound = ws_rx.next() => {
                let Some(result) = inbound else {
                    tracing::debug!(connection_id = %id, "Client {} stream ended", addr);
                    break;
                };
                match result {
                    Ok(Message::Text(text)) => {
                        manager.handle_text(id, &text).await;
                    }
                    Ok(Message::Pong(_)) => {
                        manager.mark_alive(id).await;
                    }
                    // The websocket layer answers pings itself.
                    Ok(Message::Ping(_)) => {
                        tracing::trace!(connection_id = %id, "Ping from {}", addr);
                    }
                    Ok(Message::Close(_)) => {
                        tracing::debug!(connection_id = %id, "Client {} sent close frame", addr);
                        break;
                    }
                    Ok(Message::Binary(_)) => {
                        tracing::debug!(connection_id = %id, "Ignoring binary frame from {}", addr);
                    }
                    Err(e) => {
                        tracing::warn!(connection_id = %id, "WebSocket error from {}: {}", addr, e);
                        break;
                    }
                }
            }
        }
    }

    manager.unregister(id).await;
}

/// Send a ServerFrame over WebSocket.
async fn send_frame<S>(
    sink: &mut S,
    frame: &ServerFrame,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let json = serde_json::to_string(frame)?;
    sink.send(Message::Text(json)).await?;
    Ok(())
}
