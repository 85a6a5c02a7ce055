//! TTL-cached view of the models the backend reports.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::llm::GenerationBackend;

/// Immutable list of model names captured from the backend at one point in time.
#[derive(Debug, Clone)]
pub struct DirectorySnapshot {
    pub models: Vec<String>,
    pub fetched_at: Instant,
    pub captured_at: DateTime<Utc>,
}

impl DirectorySnapshot {
    fn new(models: Vec<String>) -> Self {
        Self {
            models,
            fetched_at: Instant::now(),
            captured_at: Utc::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }
}

/// Cached model directory.
///
/// Snapshots are replaced wholesale; readers hold an `Arc` to either the old
/// or the new one, never a mix.
pub struct ModelDirectory {
    backend: Arc<dyn GenerationBackend>,
    ttl: Duration,
    preferred_default: Option<String>,
    snapshot: RwLock<Option<Arc<DirectorySnapshot>>>,
    /// Serializes refreshes so concurrent callers share one backend query.
    refresh_lock: Mutex<()>,
}

impl ModelDirectory {
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        ttl: Duration,
        preferred_default: Option<String>,
    ) -> Self {
        Self {
            backend,
            ttl,
            preferred_default,
            snapshot: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Known model names, refreshed from the backend when the snapshot is stale.
    ///
    /// Never fails: on backend error the previous snapshot (or an empty list)
    /// is returned.
    pub async fn list_models(&self) -> Vec<String> {
        if let Some(fresh) = self.fresh_snapshot().await {
            return fresh.models.clone();
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited for the lock.
        if let Some(fresh) = self.fresh_snapshot().await {
            return fresh.models.clone();
        }

        match self.backend.list_models().await {
            Ok(models) => {
                tracing::debug!("Model directory refreshed: {} models", models.len());
                let snapshot = Arc::new(DirectorySnapshot::new(models));
                *self.snapshot.write().await = Some(snapshot.clone());
                snapshot.models.clone()
            }
            Err(e) => {
                tracing::warn!("Failed to refresh model directory, serving previous snapshot: {}", e);
                self.snapshot
                    .read()
                    .await
                    .as_ref()
                    .map(|s| s.models.clone())
                    .unwrap_or_default()
            }
        }
    }

    /// Current snapshot without triggering a refresh.
    pub async fn snapshot(&self) -> Option<Arc<DirectorySnapshot>> {
        self.snapshot.read().await.clone()
    }

    /// Default model for `models`: the configured preference if the backend
    /// has it, else the first entry.
    pub fn default_model(&self, models: &[String]) -> Option<String> {
        self.preferred_default
            .as_ref()
            .filter(|preferred| models.contains(*preferred))
            .or_else(|| models.first())
            .cloned()
    }

    /// Pick the model to serve a request: the requested one if known, else the default.
    pub fn resolve(&self, requested: Option<&str>, models: &[String]) -> Option<String> {
        match requested {
            Some(name) if models.iter().any(|m| m == name) => Some(name.to_string()),
            Some(name) => {
                let fallback = self.default_model(models);
                tracing::debug!("Requested model {} not in directory, using {:?}", name, fallback);
                fallback
            }
            None => self.default_model(models),
        }
    }

    async fn fresh_snapshot(&self) -> Option<Arc<DirectorySnapshot>> {
        self.snapshot
            .read()
            .await
            .as_ref()
            .filter(|s| s.age() <= self.ttl)
            .cloned()
    }
}
