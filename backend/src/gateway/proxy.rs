//! Generation proxy: one streaming backend call per request, re-framed for the client.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use sofia_common::{DoneStats, ServerFrame};

use super::residency::ResidencyCache;
use super::session::{Session, SessionId};
use crate::codec::LineDecoder;
use crate::config::GenerationOptions;
use crate::llm::{BackendError, GenerateRequest, GenerationBackend};

/// Destination for the frames of one session.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Queue a frame. Returns `false` once the receiving side is gone.
    async fn send_frame(&self, frame: ServerFrame) -> bool;
}

#[async_trait]
impl FrameSink for mpsc::Sender<ServerFrame> {
    async fn send_frame(&self, frame: ServerFrame) -> bool {
        self.send(frame).await.is_ok()
    }
}

/// How a generation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    /// `done` was sent with these stats.
    Completed(DoneStats),
    /// `error` was sent with this message.
    Failed(String),
    /// The client went away; nothing more was sent.
    Cancelled,
}

enum Step {
    Continue,
    Finished,
    Failed(String),
    Cancelled,
}

pub struct GenerationProxy {
    backend: Arc<dyn GenerationBackend>,
    residency: Arc<ResidencyCache>,
    options: GenerationOptions,
}

impl GenerationProxy {
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        residency: Arc<ResidencyCache>,
        options: GenerationOptions,
    ) -> Self {
        Self {
            backend,
            residency,
            options,
        }
    }

    /// Stream a completion for `prompt` from `model` into `sink`.
    ///
    /// The model must already be resident. Emits `start`, the tokens, then
    /// exactly one of `done` or `error`, unless the sink closes first.
    pub async fn generate(
        &self,
        session_id: SessionId,
        model: &str,
        prompt: &str,
        sink: &dyn FrameSink,
    ) -> GenerationOutcome {
        if !sink
            .send_frame(ServerFrame::Start {
                model: model.to_string(),
            })
            .await
        {
            return GenerationOutcome::Cancelled;
        }

        let mut session = Session::start(session_id, model, prompt);
        let request = GenerateRequest::streaming(model, prompt, self.options.clone());

        let mut stream = match self.backend.generate_stream(&request).await {
            Ok(stream) => stream,
            Err(e) => return self.fail(&session, e, sink).await,
        };

        let mut decoder = LineDecoder::new();
        let mut finished = false;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => return self.fail(&session, e, sink).await,
            };

            for event in decoder.decode(&chunk) {
                match self.handle_event(&event, &mut session, sink).await {
                    Step::Continue => {}
                    Step::Finished => {
                        finished = true;
                        break;
                    }
                    Step::Failed(message) => return self.fail_in_band(&session, message, sink).await,
                    Step::Cancelled => return self.cancelled(&session),
                }
            }

            if finished {
                break;
            }
        }

        if decoder.dropped() > 0 {
            tracing::warn!(
                session_id = %session.id,
                model = %session.model,
                "Skipped {} malformed backend lines",
                decoder.dropped()
            );
        }

        // Stream ended without `done: true`; whatever is left in the carry is the last word.
        if !finished {
            if decoder.pending() > 0 {
                tracing::debug!(session_id = %session.id, "Flushing {} carried bytes", decoder.pending());
            }
            if let Some(event) = decoder.finish() {
                match self.handle_event(&event, &mut session, sink).await {
                    Step::Continue | Step::Finished => {}
                    Step::Failed(message) => return self.fail_in_band(&session, message, sink).await,
                    Step::Cancelled => return self.cancelled(&session),
                }
            }
        }

        let stats = session.done_stats();
        if !sink.send_frame(ServerFrame::Done { stats }).await {
            return self.cancelled(&session);
        }

        tracing::info!(
            session_id = %session.id,
            model = %session.model,
            "Generation complete: {} tokens in {} ms (ttft {} ms)",
            stats.tokens,
            stats.total,
            stats.ttft
        );
        GenerationOutcome::Completed(stats)
    }

    async fn handle_event(&self, event: &Value, session: &mut Session, sink: &dyn FrameSink) -> Step {
        if let Some(error) = event.get("error") {
            let message = error
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Step::Failed(message);
        }

        if let Some(text) = event.get("response").and_then(Value::as_str) {
            if !text.is_empty() {
                session.record_token();
                let frame = ServerFrame::Token {
                    text: text.to_string(),
                };
                if !sink.send_frame(frame).await {
                    return Step::Cancelled;
                }
            }
        }

        if event.get("done").and_then(Value::as_bool).unwrap_or(false) {
            Step::Finished
        } else {
            Step::Continue
        }
    }

    async fn fail(&self, session: &Session, error: BackendError, sink: &dyn FrameSink) -> GenerationOutcome {
        if error.is_model_not_found() {
            self.residency.mark_unloaded(&session.model).await;
        }
        tracing::warn!(
            session_id = %session.id,
            model = %session.model,
            "Generation failed after {} tokens: {}",
            session.token_count(),
            error
        );
        self.send_error(error.to_string(), sink).await
    }

    async fn fail_in_band(&self, session: &Session, message: String, sink: &dyn FrameSink) -> GenerationOutcome {
        if message.contains("not found") {
            self.residency.mark_unloaded(&session.model).await;
        }
        tracing::warn!(
            session_id = %session.id,
            model = %session.model,
            "Backend reported an error mid-stream: {}",
            message
        );
        self.send_error(message, sink).await
    }

    async fn send_error(&self, message: String, sink: &dyn FrameSink) -> GenerationOutcome {
        if sink.send_frame(ServerFrame::error(message.clone())).await {
            GenerationOutcome::Failed(message)
        } else {
            GenerationOutcome::Cancelled
        }
    }

    fn cancelled(&self, session: &Session) -> GenerationOutcome {
        tracing::debug!(
            session_id = %session.id,
            "Client gone, abandoning generation after {} tokens",
            session.token_count()
        );
        GenerationOutcome::Cancelled
    }
}
