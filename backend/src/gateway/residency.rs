//! Model residency tracking with deduplicated warm-ups.
//!
//! A model is in exactly one of three states. The first caller to find a
//! model `Unloaded` claims it by switching it to `Loading` before any backend
//! call is made; every other caller sees `Loading` and waits on the same
//! completion signal. At most one warm-up per model is in flight, and all
//! waiters observe the same result.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, RwLock};

use crate::llm::{BackendError, GenerationBackend};

/// Result of one warm-up, shared by every caller waiting on it.
type LoadResult = Result<(), BackendError>;

/// Completion signal of an in-flight load: `None` until the warm-up finishes.
type LoadSignal = watch::Receiver<Option<LoadResult>>;

#[derive(Debug, Clone)]
enum Residency {
    Unloaded,
    Loading(LoadSignal),
    Resident,
}

#[derive(Debug, Clone)]
struct ModelRecord {
    state: Residency,
    last_access: Option<DateTime<Utc>>,
    load_count: u64,
}

impl Default for ModelRecord {
    fn default() -> Self {
        Self {
            state: Residency::Unloaded,
            last_access: None,
            load_count: 0,
        }
    }
}

/// Observability snapshot of the residency map.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResidencyStats {
    pub resident: Vec<String>,
    pub loading: Vec<String>,
    pub last_access: BTreeMap<String, DateTime<Utc>>,
    pub load_counts: BTreeMap<String, u64>,
}

pub struct ResidencyCache {
    backend: Arc<dyn GenerationBackend>,
    records: Arc<RwLock<HashMap<String, ModelRecord>>>,
}

impl ResidencyCache {
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self {
            backend,
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Make sure `model` is resident, warming it up if needed.
    ///
    /// Returns `false` if the warm-up failed; the model is then `Unloaded`
    /// again and a later call retries.
    pub async fn ensure_loaded(&self, model: &str) -> bool {
        self.load(model).await.is_ok()
    }

    /// Like [`ensure_loaded`](Self::ensure_loaded), but keeps the backend's
    /// reason when the warm-up fails. Every waiter gets the same error.
    pub async fn load(&self, model: &str) -> Result<(), BackendError> {
        let mut signal = {
            let mut records = self.records.write().await;
            let record = records.entry(model.to_string()).or_default();
            match &record.state {
                Residency::Resident => {
                    record.last_access = Some(Utc::now());
                    return Ok(());
                }
                Residency::Loading(signal) => {
                    tracing::debug!("Model {} is already loading, waiting", model);
                    signal.clone()
                }
                Residency::Unloaded => {
                    let (tx, rx) = watch::channel(None);
                    record.state = Residency::Loading(rx.clone());
                    self.spawn_load(model.to_string(), tx);
                    rx
                }
            }
        };

        let result = match signal.wait_for(Option::is_some).await {
            Ok(result) => (*result).clone(),
            // The load task went away without reporting (runtime shutdown).
            Err(_) => None,
        };
        result.unwrap_or_else(|| {
            Err(BackendError::Client(format!(
                "warm-up of model {} ended without a result",
                model
            )))
        })
    }

    /// Run the warm-up in its own task so a caller dropping out mid-load
    /// cannot leave the record stuck in `Loading`.
    fn spawn_load(&self, model: String, done: watch::Sender<Option<LoadResult>>) {
        let backend = self.backend.clone();
        let records = self.records.clone();

        tokio::spawn(async move {
            tracing::info!("Warming up model {}", model);
            let started = std::time::Instant::now();
            let result = backend.warm_up(&model).await;

            {
                let mut records = records.write().await;
                let record = records.entry(model.clone()).or_default();
                match &result {
                    Ok(()) => {
                        record.state = Residency::Resident;
                        record.last_access = Some(Utc::now());
                        record.load_count += 1;
                        tracing::info!(
                            "Model {} resident after {} ms (load #{})",
                            model,
                            started.elapsed().as_millis(),
                            record.load_count
                        );
                    }
                    Err(e) => {
                        record.state = Residency::Unloaded;
                        tracing::warn!("Warm-up of model {} failed: {}", model, e);
                    }
                }
            }

            // Waiters keep their receiver, so the value stays observable
            // after the record has moved on.
            let _ = done.send(Some(result));
        });
    }

    /// Forget that `model` is resident, e.g. after the backend reported it missing.
    pub async fn mark_unloaded(&self, model: &str) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(model) {
            if matches!(record.state, Residency::Resident) {
                record.state = Residency::Unloaded;
                tracing::info!("Model {} marked unloaded", model);
            }
        }
    }

    pub async fn is_resident(&self, model: &str) -> bool {
        self.records
            .read()
            .await
            .get(model)
            .is_some_and(|r| matches!(r.state, Residency::Resident))
    }

    pub async fn stats(&self) -> ResidencyStats {
        let records = self.records.read().await;
        let mut stats = ResidencyStats::default();

        for (name, record) in records.iter() {
            match record.state {
                Residency::Resident => stats.resident.push(name.clone()),
                Residency::Loading(_) => stats.loading.push(name.clone()),
                Residency::Unloaded => {}
            }
            if let Some(at) = record.last_access {
                stats.last_access.insert(name.clone(), at);
            }
            if record.load_count > 0 {
                stats.load_counts.insert(name.clone(), record.load_count);
            }
        }

        stats.resident.sort();
        stats.loading.sort();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::FakeBackend;
    use std::time::Duration;

    #[tokio::test]
    async fn test_first_load_warms_up_once() {
        let backend = Arc::new(FakeBackend::new(&["m"]));
        let cache = ResidencyCache::new(backend.clone());

        assert!(cache.ensure_loaded("m").await);
        assert!(cache.is_resident("m").await);
        assert!(cache.ensure_loaded("m").await);

        assert_eq!(backend.warm_up_calls(), 1);
        let stats = cache.stats().await;
        assert_eq!(stats.resident, vec!["m"]);
        assert_eq!(stats.load_counts.get("m"), Some(&1));
        assert!(stats.last_access.contains_key("m"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_warm_up() {
        let backend = Arc::new(FakeBackend::new(&["m"]));
        backend.set_warm_up_delay(Duration::from_millis(50));
        let cache = Arc::new(ResidencyCache::new(backend.clone()));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.ensure_loaded("m").await })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(backend.warm_up_calls(), 1);
        assert_eq!(cache.stats().await.load_counts.get("m"), Some(&1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failure_fans_out_to_all_waiters() {
        let backend = Arc::new(FakeBackend::new(&["m"]));
        backend.set_warm_up_delay(Duration::from_millis(50));
        backend.fail_warm_up("m");
        let cache = Arc::new(ResidencyCache::new(backend.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.ensure_loaded("m").await })
            })
            .collect();

        for handle in handles {
            assert!(!handle.await.unwrap());
        }
        assert_eq!(backend.warm_up_calls(), 1);
        assert!(!cache.is_resident("m").await);
        assert!(cache.stats().await.load_counts.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failure_reason_shared_by_waiters() {
        let backend = Arc::new(FakeBackend::new(&["m"]));
        backend.set_warm_up_delay(Duration::from_millis(50));
        backend.fail_warm_up("m");
        let cache = Arc::new(ResidencyCache::new(backend.clone()));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.load("m").await })
            })
            .collect();

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(err.is_model_not_found());
            assert_eq!(err.to_string(), "Model 'm' not found. Run: ollama pull m");
        }
        assert_eq!(backend.warm_up_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_load_can_be_retried() {
        let backend = Arc::new(FakeBackend::new(&["m"]));
        backend.fail_warm_up("m");
        let cache = ResidencyCache::new(backend.clone());

        assert!(!cache.ensure_loaded("m").await);
        backend.allow_warm_up("m");
        assert!(cache.ensure_loaded("m").await);
        assert_eq!(backend.warm_up_calls(), 2);
    }

    #[tokio::test]
    async fn test_models_load_independently() {
        let backend = Arc::new(FakeBackend::new(&["a", "b"]));
        let cache = ResidencyCache::new(backend.clone());

        assert!(cache.ensure_loaded("a").await);
        assert!(cache.ensure_loaded("b").await);
        assert_eq!(backend.warm_up_calls(), 2);
        assert_eq!(cache.stats().await.resident, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_mark_unloaded_forces_new_warm_up() {
        let backend = Arc::new(FakeBackend::new(&["m"]));
        let cache = ResidencyCache::new(backend.clone());

        assert!(cache.ensure_loaded("m").await);
        cache.mark_unloaded("m").await;
        assert!(!cache.is_resident("m").await);

        assert!(cache.ensure_loaded("m").await);
        assert_eq!(backend.warm_up_calls(), 2);
        assert_eq!(cache.stats().await.load_counts.get("m"), Some(&2));
    }

    #[tokio::test]
    async fn test_stats_do_not_wait_for_loads() {
        let backend = Arc::new(FakeBackend::new(&["slow"]));
        backend.set_warm_up_delay(Duration::from_secs(5));
        let cache = Arc::new(ResidencyCache::new(backend.clone()));

        let loader = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.ensure_loaded("slow").await })
        };
        // Let the loader claim the slot.
        while cache.stats().await.loading.is_empty() {
            tokio::task::yield_now().await;
        }

        let stats = tokio::time::timeout(Duration::from_millis(100), cache.stats())
            .await
            .expect("stats blocked on an in-flight load");
        assert_eq!(stats.loading, vec!["slow"]);
        assert!(stats.resident.is_empty());
        loader.abort();
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_strand_load() {
        let backend = Arc::new(FakeBackend::new(&["m"]));
        backend.set_warm_up_delay(Duration::from_millis(30));
        let cache = Arc::new(ResidencyCache::new(backend.clone()));

        let caller = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.ensure_loaded("m").await })
        };
        while cache.stats().await.loading.is_empty() {
            tokio::task::yield_now().await;
        }
        caller.abort();

        assert!(cache.ensure_loaded("m").await);
        assert_eq!(backend.warm_up_calls(), 1);
    }
}
