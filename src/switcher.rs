//! Bounded LRU tracking of models resident in the inference backend

use crate::error::Result;
use crate::metrics;
use crate::types::{DownloadProgress, GenerationConfig, ModelSpec};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Callback receiving load progress
pub type ProgressHandler = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// Generated tokens, ending early with an error on failure or cancellation
pub type TokenStream = BoxStream<'static, Result<String>>;

/// Inference engine that holds loaded models
///
/// Implementations allow one load at a time and report
/// [`Error::LoadInProgress`](crate::Error::LoadInProgress) otherwise.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn load_model(&self, spec: &ModelSpec) -> Result<()>;

    async fn load_model_with_progress(
        &self,
        spec: &ModelSpec,
        progress: ProgressHandler,
    ) -> Result<()> {
        let _ = progress;
        self.load_model(spec).await
    }

    fn generate(&self, prompt: &str, config: &GenerationConfig) -> TokenStream;

    async fn unload_model(&self);

    async fn is_loaded(&self) -> bool;

    async fn current_model(&self) -> Option<ModelSpec>;
}

/// A model tracked as resident
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedModelEntry {
    pub spec: ModelSpec,
    pub last_accessed: DateTime<Utc>,
    /// Logical access order; larger is more recent
    pub access_seq: u64,
}

#[derive(Default)]
struct Residency {
    loaded: HashMap<String, LoadedModelEntry>,
    clock: u64,
}

/// Keeps at most `max_loaded_models` models tracked, evicting the least
/// recently used one when a new model has to be loaded
///
/// The lock is held across eviction and the backend load, so concurrent
/// `ensure_loaded` calls are applied one after another. Tracking is
/// bookkeeping only: it does not check how many models the backend can
/// actually hold.
pub struct ModelSwitcher {
    backend: Arc<dyn InferenceBackend>,
    max_loaded_models: usize,
    state: Mutex<Residency>,
}

impl ModelSwitcher {
    pub fn new(backend: Arc<dyn InferenceBackend>, max_loaded_models: usize) -> Self {
        let max_loaded_models = if max_loaded_models == 0 {
            tracing::warn!("max_loaded_models of 0 is not usable, using 1");
            1
        } else {
            max_loaded_models
        };

        Self {
            backend,
            max_loaded_models,
            state: Mutex::new(Residency::default()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn InferenceBackend> {
        &self.backend
    }

    pub fn max_loaded_models(&self) -> usize {
        self.max_loaded_models
    }

    /// Make sure `spec` is loaded, evicting the least recently used model if needed
    pub async fn ensure_loaded(&self, spec: &ModelSpec) -> Result<()> {
        self.ensure_loaded_inner(spec, None).await
    }

    /// Same as [`ensure_loaded`](Self::ensure_loaded), reporting backend load progress
    pub async fn ensure_loaded_with_progress(
        &self,
        spec: &ModelSpec,
        progress: ProgressHandler,
    ) -> Result<()> {
        self.ensure_loaded_inner(spec, Some(progress)).await
    }

    async fn ensure_loaded_inner(
        &self,
        spec: &ModelSpec,
        progress: Option<ProgressHandler>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.clock += 1;
        let seq = state.clock;

        if let Some(entry) = state.loaded.get_mut(&spec.id)
            && entry.spec == *spec
        {
            entry.last_accessed = Utc::now();
            entry.access_seq = seq;
            tracing::debug!(model_id = %spec.id, "Model already loaded");
            return Ok(());
        }

        if state.loaded.remove(&spec.id).is_some() {
            // Same id, different configuration: the new load replaces it
            tracing::info!(model_id = %spec.id, "Replacing loaded model with changed spec");
        } else if state.loaded.len() >= self.max_loaded_models
            && let Some(victim) = state
                .loaded
                .values()
                .min_by_key(|entry| entry.access_seq)
                .map(|entry| entry.spec.id.clone())
        {
            state.loaded.remove(&victim);
            tracing::info!(
                evicted = %victim,
                model_id = %spec.id,
                "Evicting least recently used model"
            );
            metrics::record_model_eviction(&victim);
            self.backend.unload_model().await;
        }

        tracing::info!(model_id = %spec.id, context_length = spec.context_length, "Loading model");
        let result = match progress {
            Some(handler) => self.backend.load_model_with_progress(spec, handler).await,
            None => self.backend.load_model(spec).await,
        };

        if let Err(e) = result {
            tracing::warn!(model_id = %spec.id, error = %e, "Model load failed");
            metrics::update_loaded_models(state.loaded.len());
            return Err(e);
        }

        state.loaded.insert(
            spec.id.clone(),
            LoadedModelEntry {
                spec: spec.clone(),
                last_accessed: Utc::now(),
                access_seq: seq,
            },
        );
        metrics::record_model_load(&spec.id);
        metrics::update_loaded_models(state.loaded.len());

        Ok(())
    }

    /// Stop tracking `spec`, unloading the backend only if it is the active model
    pub async fn unload(&self, spec: &ModelSpec) {
        let mut state = self.state.lock().await;

        match state.loaded.get(&spec.id) {
            Some(entry) if entry.spec == *spec => {}
            _ => return,
        }
        state.loaded.remove(&spec.id);
        metrics::update_loaded_models(state.loaded.len());

        if self.backend.current_model().await.as_ref() == Some(spec) {
            self.backend.unload_model().await;
            tracing::info!(model_id = %spec.id, "Model unloaded");
        } else {
            tracing::debug!(model_id = %spec.id, "Model untracked, backend holds another model");
        }
    }

    /// Forget every tracked model and unload the backend
    pub async fn unload_all(&self) {
        let mut state = self.state.lock().await;
        let count = state.loaded.len();
        state.loaded.clear();
        metrics::update_loaded_models(0);

        self.backend.unload_model().await;
        tracing::info!(models = count, "All models unloaded");
    }

    /// Tracked specs, most recently accessed first
    pub async fn loaded_model_specs(&self) -> Vec<ModelSpec> {
        let state = self.state.lock().await;
        let mut entries: Vec<&LoadedModelEntry> = state.loaded.values().collect();
        entries.sort_by(|a, b| b.access_seq.cmp(&a.access_seq));
        entries.into_iter().map(|entry| entry.spec.clone()).collect()
    }

    pub async fn loaded_entries(&self) -> Vec<LoadedModelEntry> {
        let state = self.state.lock().await;
        state.loaded.values().cloned().collect()
    }

    pub async fn is_loaded(&self, spec: &ModelSpec) -> bool {
        let state = self.state.lock().await;
        state
            .loaded
            .get(&spec.id)
            .is_some_and(|entry| entry.spec == *spec)
    }

    pub async fn loaded_count(&self) -> usize {
        self.state.lock().await.loaded.len()
    }
}
