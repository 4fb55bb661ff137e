//! In-crate test doubles for the injected collaborators

use crate::adapters::AdapterNetworkDelegate;
use crate::download::BackgroundDownloadDelegate;
use crate::error::{Error, Result};
use crate::memory::MemoryProvider;
use crate::models::registry::{DownloadedModel, ModelDownloadDelegate, ProgressSender};
use crate::store::RegistryStore;
use crate::switcher::{InferenceBackend, ProgressHandler, TokenStream};
use crate::types::{DownloadProgress, GenerationConfig, ModelSpec};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use url::Url;

/// Hub-hosted spec with a 1 GiB footprint
pub fn spec(id: &str) -> ModelSpec {
    spec_with_memory(id, 1024 * 1024 * 1024)
}

pub fn spec_with_memory(id: &str, estimated_memory_bytes: u64) -> ModelSpec {
    ModelSpec::hugging_face(id, format!("test-org/{}", id), 4096, estimated_memory_bytes)
}

// ============================================================================
// Persistence
// ============================================================================

/// In-memory registry store with save error injection
pub struct MockStore<T> {
    entries: Mutex<HashMap<String, T>>,
    save_error: Mutex<Option<String>>,
    saves: AtomicUsize,
}

impl<T> MockStore<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            save_error: Mutex::new(None),
            saves: AtomicUsize::new(0),
        }
    }

    /// Make the next save fail with `reason`
    pub fn fail_next_save(&self, reason: &str) {
        *self.save_error.lock().unwrap() = Some(reason.to_string());
    }

    /// Number of successful saves
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> RegistryStore<T> for MockStore<T> {
    async fn load(&self) -> HashMap<String, T> {
        self.entries.lock().unwrap().clone()
    }

    async fn save(&self, entries: &HashMap<String, T>) -> anyhow::Result<()> {
        if let Some(reason) = self.save_error.lock().unwrap().take() {
            anyhow::bail!(reason);
        }
        *self.entries.lock().unwrap() = entries.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Model downloads
// ============================================================================

enum DownloadBehavior {
    Succeed,
    Fail(String),
    Hang,
}

pub struct MockModelDownloader {
    size_in_bytes: u64,
    fractions: Vec<f64>,
    files_path: Option<PathBuf>,
    behavior: DownloadBehavior,
    calls: AtomicUsize,
}

impl MockModelDownloader {
    pub fn succeeding(size_in_bytes: u64) -> Self {
        Self::with_progress(size_in_bytes, Vec::new())
    }

    /// Succeeds after reporting each fraction in order
    pub fn with_progress(size_in_bytes: u64, fractions: Vec<f64>) -> Self {
        Self {
            size_in_bytes,
            fractions,
            files_path: None,
            behavior: DownloadBehavior::Succeed,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            behavior: DownloadBehavior::Fail(reason.to_string()),
            ..Self::succeeding(0)
        }
    }

    /// Never completes
    pub fn hanging() -> Self {
        Self {
            behavior: DownloadBehavior::Hang,
            ..Self::succeeding(0)
        }
    }

    pub fn with_files_path(mut self, path: PathBuf) -> Self {
        self.files_path = Some(path);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelDownloadDelegate for MockModelDownloader {
    async fn download(&self, spec: &ModelSpec, progress: ProgressSender) -> Result<DownloadedModel> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        for fraction in &self.fractions {
            let _ = progress.send(DownloadProgress {
                fraction: *fraction,
                completed_bytes: (self.size_in_bytes as f64 * fraction) as u64,
                total_bytes: self.size_in_bytes,
                current_file: Some("model.safetensors".to_string()),
            });
        }

        match &self.behavior {
            DownloadBehavior::Succeed => Ok(DownloadedModel {
                size_in_bytes: self.size_in_bytes,
                files_path: self.files_path.clone(),
            }),
            DownloadBehavior::Fail(reason) => Err(Error::DownloadFailed {
                model_id: spec.id.clone(),
                reason: reason.clone(),
            }),
            DownloadBehavior::Hang => std::future::pending().await,
        }
    }
}

// ============================================================================
// Adapter downloads
// ============================================================================

pub struct MockAdapterNetwork {
    error: Option<String>,
    write_files: bool,
    release_calls: AtomicUsize,
    hub_calls: AtomicUsize,
}

impl MockAdapterNetwork {
    pub fn new() -> Self {
        Self {
            error: None,
            write_files: false,
            release_calls: AtomicUsize::new(0),
            hub_calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            error: Some(reason.to_string()),
            ..Self::new()
        }
    }

    /// Create a small file at each destination
    pub fn writing_files(mut self) -> Self {
        self.write_files = true;
        self
    }

    pub fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }

    pub fn hub_calls(&self) -> usize {
        self.hub_calls.load(Ordering::SeqCst)
    }

    async fn fetch(&self, name: &str, destination: &Path) -> Result<()> {
        if let Some(reason) = &self.error {
            return Err(Error::DownloadFailed {
                model_id: name.to_string(),
                reason: reason.clone(),
            });
        }
        if self.write_files {
            tokio::fs::write(destination, b"adapter").await.map_err(|e| {
                Error::DownloadFailed {
                    model_id: name.to_string(),
                    reason: e.to_string(),
                }
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl AdapterNetworkDelegate for MockAdapterNetwork {
    async fn download_github_release(
        &self,
        repo: &str,
        _tag: &str,
        _asset: &str,
        destination: &Path,
    ) -> Result<()> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        self.fetch(repo, destination).await
    }

    async fn download_hugging_face(&self, id: &str, destination: &Path) -> Result<()> {
        self.hub_calls.fetch_add(1, Ordering::SeqCst);
        self.fetch(id, destination).await
    }
}

// ============================================================================
// Background transfers
// ============================================================================

pub struct MockBackgroundTransfer {
    error: Option<String>,
    resume_data: Option<Vec<u8>>,
    cancel_error: Option<String>,
    block: bool,
    cancelled: Notify,
    last_resume_data: Mutex<Option<Vec<u8>>>,
    cancel_calls: AtomicUsize,
}

impl MockBackgroundTransfer {
    pub fn new() -> Self {
        Self {
            error: None,
            resume_data: None,
            cancel_error: None,
            block: false,
            cancelled: Notify::new(),
            last_resume_data: Mutex::new(None),
            cancel_calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            error: Some(reason.to_string()),
            ..Self::new()
        }
    }

    pub fn with_resume_data(mut self, data: Vec<u8>) -> Self {
        self.resume_data = Some(data);
        self
    }

    pub fn with_cancel_error(mut self, reason: &str) -> Self {
        self.cancel_error = Some(reason.to_string());
        self
    }

    /// Transfers only finish, with `Cancelled`, once cancelled
    pub fn blocking_until_cancelled(mut self) -> Self {
        self.block = true;
        self
    }

    /// Resume data passed to the most recent transfer
    pub fn last_resume_data(&self) -> Option<Vec<u8>> {
        self.last_resume_data.lock().unwrap().clone()
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackgroundDownloadDelegate for MockBackgroundTransfer {
    async fn start_download(&self, url: &Url, resume_data: Option<Vec<u8>>) -> Result<PathBuf> {
        *self.last_resume_data.lock().unwrap() = resume_data;

        if self.block {
            self.cancelled.notified().await;
            return Err(Error::Cancelled);
        }
        if let Some(reason) = &self.error {
            return Err(Error::DownloadFailed {
                model_id: url.to_string(),
                reason: reason.clone(),
            });
        }

        let name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or("download");
        Ok(PathBuf::from("/tmp/downloads").join(name))
    }

    async fn cancel_download(&self, url: &Url) -> Result<Option<Vec<u8>>> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        self.cancelled.notify_one();

        if let Some(reason) = &self.cancel_error {
            return Err(Error::DownloadFailed {
                model_id: url.to_string(),
                reason: reason.clone(),
            });
        }
        Ok(self.resume_data.clone())
    }
}

// ============================================================================
// Inference backend
// ============================================================================

pub struct MockBackend {
    current: Mutex<Option<ModelSpec>>,
    load_error: Mutex<Option<String>>,
    load_delay: Duration,
    loading: AtomicBool,
    loads: AtomicUsize,
    unloads: AtomicUsize,
    conflicts: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
            load_error: Mutex::new(None),
            load_delay: Duration::ZERO,
            loading: AtomicBool::new(false),
            loads: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
            conflicts: AtomicUsize::new(0),
        }
    }

    pub fn with_load_delay_ms(mut self, ms: u64) -> Self {
        self.load_delay = Duration::from_millis(ms);
        self
    }

    /// Make every following load fail
    pub fn fail_loads(&self, reason: &str) {
        *self.load_error.lock().unwrap() = Some(reason.to_string());
    }

    /// Successful loads
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unload_count(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    /// Loads rejected because another load was running
    pub fn load_in_progress_errors(&self) -> usize {
        self.conflicts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    async fn load_model(&self, spec: &ModelSpec) -> Result<()> {
        if self.loading.swap(true, Ordering::SeqCst) {
            self.conflicts.fetch_add(1, Ordering::SeqCst);
            return Err(Error::LoadInProgress);
        }

        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }

        let error = self.load_error.lock().unwrap().clone();
        let result = match error {
            Some(reason) => Err(Error::LoadFailed {
                model_id: spec.id.clone(),
                reason,
            }),
            None => {
                *self.current.lock().unwrap() = Some(spec.clone());
                self.loads.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        };

        self.loading.store(false, Ordering::SeqCst);
        result
    }

    async fn load_model_with_progress(
        &self,
        spec: &ModelSpec,
        progress: ProgressHandler,
    ) -> Result<()> {
        progress(DownloadProgress::started());
        self.load_model(spec).await?;
        progress(DownloadProgress::finished(spec.estimated_memory_bytes));
        Ok(())
    }

    fn generate(&self, prompt: &str, _config: &GenerationConfig) -> TokenStream {
        let tokens: Vec<Result<String>> = prompt
            .split_whitespace()
            .map(|word| Ok(word.to_string()))
            .collect();
        futures::stream::iter(tokens).boxed()
    }

    async fn unload_model(&self) {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        *self.current.lock().unwrap() = None;
    }

    async fn is_loaded(&self) -> bool {
        self.current.lock().unwrap().is_some()
    }

    async fn current_model(&self) -> Option<ModelSpec> {
        self.current.lock().unwrap().clone()
    }
}

// ============================================================================
// Memory
// ============================================================================

pub struct FixedMemoryProvider {
    total: u64,
    available: AtomicU64,
}

impl FixedMemoryProvider {
    pub fn new(total: u64, available: u64) -> Self {
        Self {
            total,
            available: AtomicU64::new(available),
        }
    }

    pub fn set_available(&self, available: u64) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl MemoryProvider for FixedMemoryProvider {
    fn total_memory_bytes(&self) -> u64 {
        self.total
    }

    fn available_memory_bytes(&self) -> u64 {
        self.available.load(Ordering::SeqCst)
    }
}
