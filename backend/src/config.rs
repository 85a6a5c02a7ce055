//! Configuration for the streaming gateway.

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Main configuration structure for the gateway.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    /// Options passed verbatim to the backend on every generate call.
    #[serde(default)]
    pub generation: GenerationOptions,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub cors: CorsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Sent as an `info` frame when a client connects.
    #[serde(default = "default_welcome_message")]
    pub welcome_message: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            welcome_message: default_welcome_message(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Upper bound for a whole generate call, including streaming.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// How long the backend keeps a warmed model resident.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_url(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            keep_alive: default_keep_alive(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    /// Preferred fallback model. Used only when the backend reports it;
    /// otherwise the first model of the directory is the default.
    #[serde(default)]
    pub default: Option<String>,
    /// How long a model directory snapshot may be reused.
    #[serde(default = "default_directory_ttl")]
    pub directory_ttl_secs: u64,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            default: None,
            directory_ttl_secs: default_directory_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LivenessConfig {
    /// Interval between ping sweeps. A client missing one ping is dropped
    /// at the following sweep.
    #[serde(default = "default_liveness_interval")]
    pub interval_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_liveness_interval(),
        }
    }
}

/// Backend generation options (Ollama `options` object).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Context window size.
    #[serde(default = "default_num_ctx")]
    pub num_ctx: u32,
    /// Prompt processing batch size.
    #[serde(default = "default_num_batch")]
    pub num_batch: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_thread: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_mmap: Option<bool>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            num_ctx: default_num_ctx(),
            num_batch: default_num_batch(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            repeat_penalty: None,
            num_thread: None,
            use_mmap: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    /// `*` or a comma-separated list of origins.
    #[serde(default = "default_cors_origins")]
    pub origins: String,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            origins: default_cors_origins(),
        }
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_welcome_message() -> String {
    "Connected to the SofiaAI WebSocket server!".to_string()
}
fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_request_timeout() -> u64 {
    300
}
fn default_keep_alive() -> String {
    "10m".to_string()
}
fn default_directory_ttl() -> u64 {
    60
}
fn default_liveness_interval() -> u64 {
    15
}
fn default_num_ctx() -> u32 {
    2048
}
fn default_num_batch() -> u32 {
    512
}
fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    0.9
}
fn default_top_k() -> u32 {
    40
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_cors_origins() -> String {
    "*".to_string()
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (SOFIA__SECTION__KEY format)
    /// 2. sofia.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port() as i64)?
            .set_default("models.directory_ttl_secs", default_directory_ttl() as i64)?
            .set_default("liveness.interval_secs", default_liveness_interval() as i64)?
            .add_source(File::with_name("sofia").required(false))
            .add_source(
                Environment::with_prefix("SOFIA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
