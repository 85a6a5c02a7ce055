//! Per-request generation state.

use tokio::time::Instant;
use uuid::Uuid;

use sofia_common::DoneStats;

pub type SessionId = Uuid;

/// One prompt being answered on one connection.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub prompt: String,
    pub model: String,
    token_count: u64,
    started_at: Instant,
    first_token_at: Option<Instant>,
}

impl Session {
    /// Start the clock. Call right before the backend request is issued.
    pub fn start(id: SessionId, model: &str, prompt: &str) -> Self {
        Self {
            id,
            prompt: prompt.to_string(),
            model: model.to_string(),
            token_count: 0,
            started_at: Instant::now(),
            first_token_at: None,
        }
    }

    /// Count one non-empty token.
    pub fn record_token(&mut self) {
        if self.first_token_at.is_none() {
            self.first_token_at = Some(Instant::now());
        }
        self.token_count += 1;
    }

    pub fn token_count(&self) -> u64 {
        self.token_count
    }

    pub fn done_stats(&self) -> DoneStats {
        let ttft = self
            .first_token_at
            .map(|at| at.duration_since(self.started_at).as_millis() as u64)
            .unwrap_or(0);

        DoneStats {
            tokens: self.token_count,
            total: self.started_at.elapsed().as_millis() as u64,
            ttft,
        }
    }
}
