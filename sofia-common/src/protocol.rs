//! WebSocket protocol types for client-gateway communication.
//!
//! # Protocol Overview
//!
//! The protocol uses JSON-encoded text messages over WebSocket.
//!
//! ## Connection Flow
//!
//! 1. Client connects to the gateway `/ws` endpoint
//! 2. Gateway sends an `info` frame with a welcome message
//! 3. Client sends a [`ClientRequest`] with a prompt and optional model
//! 4. Gateway answers with `start`, zero or more `token`, then `done`
//!    (or a single `error` if the request or generation failed)
//!
//! Only one generation may be in flight per connection. A request sent while
//! another one is streaming is answered with `error` and dropped.
//!
//! Liveness is handled with WebSocket ping/pong at the transport level. A
//! client that misses a ping is disconnected at the next sweep.

use serde::{Deserialize, Serialize};

/// Message sent from client to gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    /// Prompt text. Missing is treated as empty.
    #[serde(default)]
    pub prompt: String,
    /// Requested model. Falls back to the gateway default when absent or unknown.
    #[serde(default, alias = "model", skip_serializing_if = "Option::is_none")]
    pub modelo: Option<String>,
}

impl ClientRequest {
    pub fn new(prompt: impl Into<String>, modelo: Option<String>) -> Self {
        Self {
            prompt: prompt.into(),
            modelo,
        }
    }

    /// True when the prompt has no visible content.
    pub fn is_blank(&self) -> bool {
        self.prompt.trim().is_empty()
    }
}

/// Frames sent from gateway to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Connection-level notice (welcome, etc.).
    Info { message: String },
    /// Generation began with this model.
    Start { model: String },
    /// One increment of generated text, append-only.
    Token { text: String },
    /// Generation finished.
    Done { stats: DoneStats },
    /// Request or generation failed; the session is aborted.
    Error { message: String },
}

/// Completion statistics carried by the `done` frame. Durations in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneStats {
    /// Number of non-empty token events.
    pub tokens: u64,
    /// Time from backend call issuance to stream completion.
    pub total: u64,
    /// Time to first token, 0 if none arrived.
    pub ttft: u64,
}

impl ServerFrame {
    pub fn info(message: impl Into<String>) -> Self {
        ServerFrame::Info {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
        }
    }

    /// Whether this frame ends a generation session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerFrame::Done { .. } | ServerFrame::Error { .. })
    }

    /// Wire name of the frame kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::Info { .. } => "info",
            ServerFrame::Start { .. } => "start",
            ServerFrame::Token { .. } => "token",
            ServerFrame::Done { .. } => "done",
            ServerFrame::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_frame_serialization() {
        let frame = ServerFrame::Token {
            text: "Olá".to_string(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"type":"token","text":"Olá"}"#);
    }

    #[test]
    fn test_done_frame_nests_stats() {
        let frame = ServerFrame::Done {
            stats: DoneStats {
                tokens: 12,
                total: 840,
                ttft: 95,
            },
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "done");
        assert_eq!(value["stats"]["tokens"], 12);
        assert_eq!(value["stats"]["total"], 840);
        assert_eq!(value["stats"]["ttft"], 95);
    }

    #[test]
    fn test_error_and_info_frames() {
        let json = serde_json::to_string(&ServerFrame::error("boom")).unwrap();
        assert_eq!(json, r#"{"type":"error","message":"boom"}"#);

        let json = serde_json::to_string(&ServerFrame::info("hello")).unwrap();
        assert_eq!(json, r#"{"type":"info","message":"hello"}"#);
    }

    #[test]
    fn test_start_frame_parses_back() {
        let parsed: ServerFrame =
            serde_json::from_str(r#"{"type":"start","model":"sofiaai_gmm_v3:latest"}"#).unwrap();
        assert_eq!(
            parsed,
            ServerFrame::Start {
                model: "sofiaai_gmm_v3:latest".to_string()
            }
        );
    }

    #[test]
    fn test_terminal_frames() {
        assert!(ServerFrame::error("x").is_terminal());
        assert!(ServerFrame::Done {
            stats: DoneStats::default()
        }
        .is_terminal());
        assert!(!ServerFrame::info("x").is_terminal());
        assert!(!ServerFrame::Token {
            text: "a".to_string()
        }
        .is_terminal());
    }

    #[test]
    fn test_client_request_minimal() {
        let req: ClientRequest = serde_json::from_str(r#"{"prompt":"hi"}"#).unwrap();
        assert_eq!(req.prompt, "hi");
        assert!(req.modelo.is_none());
    }

    #[test]
    fn test_client_request_with_model_and_alias() {
        let req: ClientRequest =
            serde_json::from_str(r#"{"prompt":"hi","modelo":"modelA"}"#).unwrap();
        assert_eq!(req.modelo.as_deref(), Some("modelA"));

        let req: ClientRequest =
            serde_json::from_str(r#"{"prompt":"hi","model":"modelB"}"#).unwrap();
        assert_eq!(req.modelo.as_deref(), Some("modelB"));
    }

    #[test]
    fn test_client_request_missing_prompt_is_blank() {
        let req: ClientRequest = serde_json::from_str(r#"{"modelo":"m"}"#).unwrap();
        assert!(req.is_blank());

        let req = ClientRequest::new("   \n\t", None);
        assert!(req.is_blank());
    }

    #[test]
    fn test_client_request_rejects_non_string_prompt() {
        let result = serde_json::from_str::<ClientRequest>(r#"{"prompt":42}"#);
        assert!(result.is_err());
    }
}
