use serde::{Deserialize, Serialize};

/// One line of an Ollama `/api/generate` stream.
#[derive(Debug, Serialize, Deserialize)]
pub struct MockGenerateChunk {
    pub model: String,
    pub response: String,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_count: Option<u32>,
}

impl MockGenerateChunk {
    pub fn token(text: &str) -> Self {
        Self {
            model: "mock".to_string(),
            response: text.to_string(),
            done: false,
            eval_count: None,
        }
    }

    pub fn done(eval_count: u32) -> Self {
        Self {
            model: "mock".to_string(),
            response: String::new(),
            done: true,
            eval_count: Some(eval_count),
        }
    }

    pub fn line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap();
        line.push('\n');
        line
    }
}

/// Full NDJSON body streaming `tokens` and a final `done` line.
pub fn ndjson(tokens: &[&str]) -> String {
    let mut body: String = tokens.iter().map(|t| MockGenerateChunk::token(t).line()).collect();
    body.push_str(&MockGenerateChunk::done(tokens.len() as u32).line());
    body
}

/// `/api/tags` response listing `names`.
pub fn tags_json(names: &[&str]) -> serde_json::Value {
    serde_json::json!({
        "models": names
            .iter()
            .map(|name| serde_json::json!({ "name": name, "size": 1_000_000 }))
            .collect::<Vec<_>>()
    })
}

/// Non-streaming `/api/generate` response to a warm-up call.
pub fn warm_up_json(model: &str) -> serde_json::Value {
    serde_json::json!({
        "model": model,
        "response": "",
        "done": true,
        "done_reason": "load"
    })
}

pub fn error_json(message: &str) -> serde_json::Value {
    serde_json::json!({
        "error": message
    })
}
