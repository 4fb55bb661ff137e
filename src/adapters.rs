//! Persisted registry of LoRA adapters
//!
//! Adapters are keyed by [`AdapterSource::cache_key`] rather than by a caller
//! supplied id. Release assets are version-gated on their tag; hub adapters
//! are cached on presence; local adapters are never cached.

use crate::error::{Error, Result};
use crate::metrics;
use crate::models::registry::remove_path_best_effort;
use crate::store::{JsonFileStore, RegistryStore, Snapshot};
use crate::types::AdapterSource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// File name of the adapter registry snapshot inside the adapter directory
pub const ADAPTER_REGISTRY_FILE: &str = "adapter-registry.json";

/// Persisted record for a downloaded adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterInfo {
    pub key: String,
    /// Release tag or hub id at download time
    pub version: String,
    pub source: AdapterSource,
    pub downloaded_at: DateTime<Utc>,
    pub local_path: PathBuf,
}

/// Fetches adapter files to a destination path
#[async_trait]
pub trait AdapterNetworkDelegate: Send + Sync {
    async fn download_github_release(
        &self,
        repo: &str,
        tag: &str,
        asset: &str,
        destination: &Path,
    ) -> Result<()>;

    async fn download_hugging_face(&self, id: &str, destination: &Path) -> Result<()>;
}

/// Turns an adapter source into a usable local path
#[async_trait]
pub trait AdapterResolver: Send + Sync {
    async fn resolve(&self, source: &AdapterSource) -> Result<PathBuf>;
}

/// Registry of downloaded adapters
#[derive(Clone)]
pub struct AdapterRegistry {
    adapter_dir: PathBuf,
    state: Arc<Mutex<Snapshot<AdapterInfo>>>,
    store: Arc<dyn RegistryStore<AdapterInfo>>,
    delegate: Arc<dyn AdapterNetworkDelegate>,
}

impl AdapterRegistry {
    pub fn new_with_store(
        adapter_dir: PathBuf,
        store: Arc<dyn RegistryStore<AdapterInfo>>,
        delegate: Arc<dyn AdapterNetworkDelegate>,
    ) -> Self {
        Self {
            adapter_dir,
            state: Arc::new(Mutex::new(Snapshot::new())),
            store,
            delegate,
        }
    }

    /// Create a registry persisted to `adapter-registry.json` in `adapter_dir`
    pub fn new(adapter_dir: PathBuf, delegate: Arc<dyn AdapterNetworkDelegate>) -> Self {
        let store = Arc::new(JsonFileStore::new(&adapter_dir, ADAPTER_REGISTRY_FILE));
        Self::new_with_store(adapter_dir, store, delegate)
    }

    pub fn adapter_dir(&self) -> &Path {
        &self.adapter_dir
    }

    /// Cache key for a source; same as [`AdapterSource::cache_key`]
    pub fn cache_key(source: &AdapterSource) -> String {
        source.cache_key()
    }

    /// Resolve a source to a local file, downloading it if needed
    ///
    /// The registry lock is held for the whole call, including the transfer.
    pub async fn resolve(&self, source: &AdapterSource) -> Result<PathBuf> {
        if let AdapterSource::Local { path } = source {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Err(Error::AdapterMergeFailed {
                    reason: format!("Local adapter not found at {}", path.display()),
                });
            }
            return Ok(path.clone());
        }

        let key = source.cache_key();
        let mut state = self.state.lock().await;
        let entries = state.entries(self.store.as_ref()).await;

        if let Some(info) = entries.get(&key) {
            let hit = match source {
                AdapterSource::GitHubRelease { tag, .. } => info.version == *tag,
                _ => true,
            };
            if hit {
                tracing::debug!(key = %key, version = %info.version, "Adapter cache hit");
                metrics::record_adapter_cache_hit(&key);
                return Ok(info.local_path.clone());
            }
            tracing::info!(
                key = %key,
                cached_version = %info.version,
                "Adapter version changed, downloading again"
            );
        }

        let destination = self.adapter_dir.join(&key);
        let version = self.fetch(&key, source, &destination).await?;

        let info = AdapterInfo {
            key: key.clone(),
            version,
            source: source.clone(),
            downloaded_at: Utc::now(),
            local_path: destination.clone(),
        };
        let mut next = state.entries(self.store.as_ref()).await.clone();
        next.insert(key.clone(), info);
        state.commit(self.store.as_ref(), next).await?;

        metrics::record_adapter_download(&key);
        tracing::info!(key = %key, path = ?destination, "Adapter registered");

        Ok(destination)
    }

    /// Download a remote source, returning the version to record
    async fn fetch(&self, key: &str, source: &AdapterSource, destination: &Path) -> Result<String> {
        match source {
            AdapterSource::GitHubRelease { repo, tag, asset } => {
                tracing::info!(key = %key, repo = %repo, tag = %tag, asset = %asset, "Downloading adapter release asset");
                self.delegate
                    .download_github_release(repo, tag, asset, destination)
                    .await?;
                Ok(tag.clone())
            }
            AdapterSource::HuggingFace { id } => {
                tracing::info!(key = %key, id = %id, "Downloading adapter from hub");
                self.delegate.download_hugging_face(id, destination).await?;
                Ok(id.clone())
            }
            AdapterSource::Local { path } => Err(Error::AdapterMergeFailed {
                reason: format!("Local adapter at {} is not downloadable", path.display()),
            }),
        }
    }

    /// True when the source is uncached or its stored version differs from `latest_tag`
    pub async fn is_update_available(&self, source: &AdapterSource, latest_tag: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.entries(self.store.as_ref()).await.get(&source.cache_key()) {
            Some(info) => info.version != latest_tag,
            None => true,
        }
    }

    pub async fn cached_adapters(&self) -> Vec<AdapterInfo> {
        let mut state = self.state.lock().await;
        state
            .entries(self.store.as_ref())
            .await
            .values()
            .cloned()
            .collect()
    }

    pub async fn is_cached(&self, source: &AdapterSource) -> bool {
        let mut state = self.state.lock().await;
        state
            .entries(self.store.as_ref())
            .await
            .contains_key(&source.cache_key())
    }

    /// Remove an adapter's registry entry, then its file (best effort)
    pub async fn delete_adapter(&self, source: &AdapterSource) -> Result<()> {
        let key = source.cache_key();
        let mut state = self.state.lock().await;
        let mut next = state.entries(self.store.as_ref()).await.clone();

        let Some(info) = next.remove(&key) else {
            return Ok(());
        };
        state.commit(self.store.as_ref(), next).await?;
        remove_path_best_effort(&info.local_path).await;

        tracing::info!(key = %key, "Adapter deleted");
        Ok(())
    }

    pub async fn clear_all(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let removed: Vec<PathBuf> = state
            .entries(self.store.as_ref())
            .await
            .values()
            .map(|info| info.local_path.clone())
            .collect();

        state.commit(self.store.as_ref(), HashMap::new()).await?;
        for path in &removed {
            remove_path_best_effort(path).await;
        }

        tracing::info!(adapters = removed.len(), "Adapter cache cleared");
        Ok(())
    }
}

#[async_trait]
impl AdapterResolver for AdapterRegistry {
    async fn resolve(&self, source: &AdapterSource) -> Result<PathBuf> {
        AdapterRegistry::resolve(self, source).await
    }
}
