//! Streaming gateway between WebSocket clients and the generation backend.
//!
//! This module provides:
//! - Model directory with a TTL-cached model list
//! - Residency cache deduplicating model warm-ups
//! - Generation proxy re-framing the backend stream for clients
//! - Connection manager and WebSocket handler for client channels

mod connections;
mod directory;
mod proxy;
mod residency;
mod session;
mod ws;

pub use connections::{ConnectionHandle, ConnectionId, ConnectionManager, Outbound, RequestError};
pub use directory::{DirectorySnapshot, ModelDirectory};
pub use proxy::{FrameSink, GenerationOutcome, GenerationProxy};
pub use residency::{ResidencyCache, ResidencyStats};
pub use session::{Session, SessionId};
pub use ws::ws_handler;
