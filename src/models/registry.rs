//! Persisted registry of downloaded base models

use crate::download::BackgroundDownloader;
use crate::error::{Error, Result};
use crate::metrics;
use crate::store::{JsonFileStore, RegistryStore, Snapshot};
use crate::transfer::HttpTransfer;
use crate::types::{DownloadProgress, ModelSpec};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// File name of the model registry snapshot inside the cache directory
pub const REGISTRY_FILE: &str = "registry.json";

/// Subdirectory of the cache directory used by the default background downloader
pub const BACKGROUND_DOWNLOADS_DIR: &str = "bg-downloads";

/// Persisted record for a downloaded model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedModelInfo {
    pub model_id: String,
    pub display_name: String,
    pub size_in_bytes: u64,
    pub downloaded_at: DateTime<Utc>,
    /// Registry-owned metadata path for this model
    pub local_path: PathBuf,
    /// Directory holding the weight files, removed on deletion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_files_path: Option<PathBuf>,
}

/// Sender half handed to a download delegate for progress reports
pub type ProgressSender = mpsc::UnboundedSender<DownloadProgress>;

/// Result of a successful model transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedModel {
    pub size_in_bytes: u64,
    /// Where the weight files landed, if the delegate knows
    pub files_path: Option<PathBuf>,
}

/// Performs the actual model transfer
///
/// Progress events sent on `progress` are forwarded to the caller verbatim.
#[async_trait]
pub trait ModelDownloadDelegate: Send + Sync {
    async fn download(&self, spec: &ModelSpec, progress: ProgressSender) -> Result<DownloadedModel>;
}

/// Registry of fully downloaded base models
///
/// Cloning is cheap and every clone shares the same state. Mutating
/// operations hold the registry lock until the snapshot is persisted.
#[derive(Clone)]
pub struct ModelRegistry {
    cache_dir: PathBuf,
    state: Arc<Mutex<Snapshot<CachedModelInfo>>>,
    store: Arc<dyn RegistryStore<CachedModelInfo>>,
    delegate: Arc<dyn ModelDownloadDelegate>,
    background_downloader: Arc<BackgroundDownloader>,
}

impl ModelRegistry {
    /// Create a registry with a custom persistence store
    ///
    /// The registry gets an HTTP background downloader rooted at
    /// `<cache_dir>/bg-downloads`.
    pub fn new_with_store(
        cache_dir: PathBuf,
        store: Arc<dyn RegistryStore<CachedModelInfo>>,
        delegate: Arc<dyn ModelDownloadDelegate>,
    ) -> Self {
        let downloads_dir = cache_dir.join(BACKGROUND_DOWNLOADS_DIR);
        let background_downloader = Arc::new(BackgroundDownloader::new(
            downloads_dir.clone(),
            Arc::new(HttpTransfer::new(downloads_dir)),
        ));

        Self {
            cache_dir,
            state: Arc::new(Mutex::new(Snapshot::new())),
            store,
            delegate,
            background_downloader,
        }
    }

    /// Create a registry persisted to `registry.json` in `cache_dir`
    pub fn new(cache_dir: PathBuf, delegate: Arc<dyn ModelDownloadDelegate>) -> Self {
        let store = Arc::new(JsonFileStore::new(&cache_dir, REGISTRY_FILE));
        Self::new_with_store(cache_dir, store, delegate)
    }

    /// Replace the downloader used for resumable weight transfers
    pub fn with_background_downloader(mut self, downloader: Arc<BackgroundDownloader>) -> Self {
        self.background_downloader = downloader;
        self
    }

    pub fn background_downloader(&self) -> &Arc<BackgroundDownloader> {
        &self.background_downloader
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// All registered models, in no particular order
    pub async fn cached_models(&self) -> Vec<CachedModelInfo> {
        let mut state = self.state.lock().await;
        state
            .entries(self.store.as_ref())
            .await
            .values()
            .cloned()
            .collect()
    }

    pub async fn cached_model(&self, model_id: &str) -> Option<CachedModelInfo> {
        let mut state = self.state.lock().await;
        state.entries(self.store.as_ref()).await.get(model_id).cloned()
    }

    pub async fn is_cached(&self, spec: &ModelSpec) -> bool {
        let mut state = self.state.lock().await;
        state.entries(self.store.as_ref()).await.contains_key(&spec.id)
    }

    /// Sum of `size_in_bytes` across all entries
    pub async fn total_cache_size(&self) -> u64 {
        let mut state = self.state.lock().await;
        state
            .entries(self.store.as_ref())
            .await
            .values()
            .map(|info| info.size_in_bytes)
            .sum()
    }

    /// Upsert a model by id; the last write wins
    pub async fn register_model(
        &self,
        spec: &ModelSpec,
        size_in_bytes: u64,
        model_files_path: Option<PathBuf>,
    ) -> Result<CachedModelInfo> {
        let mut state = self.state.lock().await;
        let mut next = state.entries(self.store.as_ref()).await.clone();

        let info = CachedModelInfo {
            model_id: spec.id.clone(),
            display_name: spec.display_name.clone(),
            size_in_bytes,
            downloaded_at: Utc::now(),
            local_path: self.cache_dir.join(&spec.id),
            model_files_path,
        };
        let replaced = next.insert(spec.id.clone(), info.clone()).is_some();
        state.commit(self.store.as_ref(), next).await?;

        tracing::info!(
            model_id = %spec.id,
            size_in_bytes,
            replaced,
            "Model registered"
        );
        metrics::record_model_registered(&spec.id);

        Ok(info)
    }

    /// Remove a model's registry entry, then its files (best effort)
    ///
    /// Does nothing if the model is not registered. Files are only touched
    /// once the removal has been persisted.
    pub async fn delete_cache(&self, spec: &ModelSpec) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut next = state.entries(self.store.as_ref()).await.clone();

        let Some(info) = next.remove(&spec.id) else {
            tracing::debug!(model_id = %spec.id, "Model not cached, nothing to delete");
            return Ok(());
        };
        state.commit(self.store.as_ref(), next).await?;

        if let Some(files_path) = &info.model_files_path {
            remove_path_best_effort(files_path).await;
        }

        tracing::info!(model_id = %spec.id, "Model cache deleted");
        metrics::record_model_deleted(&spec.id);

        Ok(())
    }

    /// Delete every registered model
    pub async fn clear_all_cache(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let removed: Vec<CachedModelInfo> = state
            .entries(self.store.as_ref())
            .await
            .values()
            .cloned()
            .collect();

        state.commit(self.store.as_ref(), HashMap::new()).await?;

        for info in &removed {
            if let Some(files_path) = &info.model_files_path {
                remove_path_best_effort(files_path).await;
            }
        }

        tracing::info!(models = removed.len(), "Model cache cleared");

        Ok(())
    }

    /// Download a model, yielding progress as it goes
    ///
    /// The stream starts with a `0.0` event, forwards the delegate's events
    /// unchanged, registers the model on success and ends with a `1.0` event.
    /// A delegate error ends the stream with that error and nothing is
    /// registered. Cancelling `cancel` ends the stream with
    /// [`Error::Cancelled`], also without registering.
    pub fn download_with_progress(
        &self,
        spec: &ModelSpec,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<DownloadProgress>> + Send + 'static {
        let registry = self.clone();
        let spec = spec.clone();

        async_stream::stream! {
            if cancel.is_cancelled() {
                yield Err(Error::Cancelled);
                return;
            }

            yield Ok(DownloadProgress::started());

            tracing::info!(model_id = %spec.id, "Starting model download");

            let (tx, mut rx) = mpsc::unbounded_channel();
            let delegate = registry.delegate.clone();
            let transfer = delegate.download(&spec, tx);
            tokio::pin!(transfer);

            let mut forwarding = true;
            let outcome = loop {
                let step = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => TransferStep::Cancelled,
                    progress = rx.recv(), if forwarding => match progress {
                        Some(progress) => TransferStep::Progress(progress),
                        None => TransferStep::ChannelClosed,
                    },
                    result = &mut transfer => TransferStep::Finished(result),
                };

                match step {
                    TransferStep::Progress(progress) => {
                        yield Ok(progress);
                    }
                    TransferStep::ChannelClosed => forwarding = false,
                    TransferStep::Cancelled => break Err(Error::Cancelled),
                    TransferStep::Finished(result) => break result,
                }
            };

            let downloaded = match outcome {
                Ok(downloaded) => downloaded,
                Err(err) => {
                    tracing::warn!(model_id = %spec.id, error = %err, "Model download did not complete");
                    yield Err(err);
                    return;
                }
            };

            // Events sent just before the delegate returned
            while let Ok(progress) = rx.try_recv() {
                yield Ok(progress);
            }

            if cancel.is_cancelled() {
                yield Err(Error::Cancelled);
                return;
            }

            let size_in_bytes = downloaded.size_in_bytes;
            if let Err(err) = registry
                .register_model(&spec, size_in_bytes, downloaded.files_path)
                .await
            {
                yield Err(err);
                return;
            }

            yield Ok(DownloadProgress::finished(size_in_bytes));
        }
    }
}

enum TransferStep {
    Progress(DownloadProgress),
    ChannelClosed,
    Cancelled,
    Finished(Result<DownloadedModel>),
}

/// Remove a file or directory, ignoring every failure
pub(crate) async fn remove_path_best_effort(path: &Path) {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => tracing::debug!(path = ?path, "Removed cached files"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = ?path, "Cached files already gone");
        }
        Err(e) => tracing::warn!(path = ?path, error = %e, "Failed to remove cached files"),
    }
}
