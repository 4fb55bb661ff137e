//! Registry snapshot persistence

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Persistence backend for a registry's `key -> record` map
///
/// Loading is permissive: a missing or unreadable snapshot is an empty map.
/// Saving writes the full snapshot and must report failures.
#[async_trait]
pub trait RegistryStore<T>: Send + Sync {
    async fn load(&self) -> HashMap<String, T>;

    async fn save(&self, entries: &HashMap<String, T>) -> Result<()>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// One pretty-printed JSON file per registry directory
pub struct JsonFileStore<T> {
    path: PathBuf,
    _record: PhantomData<fn() -> T>,
}

impl<T> JsonFileStore<T> {
    pub fn new(directory: impl AsRef<Path>, filename: &str) -> Self {
        Self {
            path: directory.as_ref().join(filename),
            _record: PhantomData,
        }
    }

    /// Location of the snapshot file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl<T> RegistryStore<T> for JsonFileStore<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn load(&self) -> HashMap<String, T> {
        let content = match fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = ?self.path, "No registry file found, starting empty");
                return HashMap::new();
            }
            Err(e) => {
                tracing::warn!(path = ?self.path, error = %e, "Failed to read registry file, starting empty");
                return HashMap::new();
            }
        };

        match serde_json::from_slice(&content) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = ?self.path, error = %e, "Registry file is corrupted, starting empty");
                HashMap::new()
            }
        }
    }

    async fn save(&self, entries: &HashMap<String, T>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create registry directory: {:?}", parent))?;
        }

        // Sorted keys keep the file diff-friendly
        let sorted: BTreeMap<&String, &T> = entries.iter().collect();
        let content =
            serde_json::to_vec_pretty(&sorted).context("Failed to serialize registry to JSON")?;

        // Atomic write: write to temp file, then rename
        let temp_file = self.path.with_extension("tmp");

        let mut file = fs::File::create(&temp_file)
            .await
            .context("Failed to create temp registry file")?;
        file.write_all(&content)
            .await
            .context("Failed to write registry file")?;
        file.sync_all()
            .await
            .context("Failed to sync registry file")?;

        fs::rename(&temp_file, &self.path)
            .await
            .context("Failed to rename temp registry file")?;

        tracing::debug!(path = ?self.path, entries = entries.len(), "Registry saved");

        Ok(())
    }
}

// ============================================================================
// Lazily loaded snapshot
// ============================================================================

/// In-memory copy of a registry map, filled from the store on first access
pub(crate) struct Snapshot<T> {
    entries: HashMap<String, T>,
    loaded: bool,
}

impl<T> Snapshot<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
            loaded: false,
        }
    }

    pub(crate) async fn entries(&mut self, store: &dyn RegistryStore<T>) -> &mut HashMap<String, T> {
        if !self.loaded {
            self.entries = store.load().await;
            self.loaded = true;
        }
        &mut self.entries
    }

    /// Save `next` and adopt it as the in-memory map
    ///
    /// On a failed save the previous entries stay in place and the store
    /// error is returned as [`crate::Error::Persistence`].
    pub(crate) async fn commit(
        &mut self,
        store: &dyn RegistryStore<T>,
        next: HashMap<String, T>,
    ) -> crate::Result<()> {
        store.save(&next).await.map_err(crate::Error::Persistence)?;
        self.entries = next;
        self.loaded = true;
        Ok(())
    }
}
