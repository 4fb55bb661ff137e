//! Model transfers backed by the HuggingFace Hub
//!
//! [`HubModelDownloader`] is the production [`ModelDownloadDelegate`]. Hub
//! models are fetched file by file into a standard HF cache layout; local
//! models are only measured.
//!
//! The repository listing carries no file sizes, so per-file events report
//! `total_bytes: 0`. The registry's closing event carries the real total.

use super::registry::{DownloadedModel, ModelDownloadDelegate, ProgressSender};
use crate::error::{Error, Result};
use crate::types::{DownloadProgress, ModelSource, ModelSpec};
use async_trait::async_trait;
use hf_hub::api::tokio::{Api, ApiBuilder};
use std::path::{Path, PathBuf};

/// Downloads models with the hf-hub client
pub struct HubModelDownloader {
    api: Api,
}

impl HubModelDownloader {
    /// Client writing into `cache_dir`, or the default HF cache when `None`
    pub fn new(cache_dir: Option<PathBuf>) -> Result<Self> {
        let api = match cache_dir {
            Some(dir) => ApiBuilder::new().with_cache_dir(dir).build(),
            None => Api::new(),
        }
        .map_err(|e| Error::DownloadFailed {
            model_id: String::new(),
            reason: format!("Failed to create HF API client: {}", e),
        })?;

        Ok(Self { api })
    }

    async fn download_from_hub(
        &self,
        spec: &ModelSpec,
        repo_id: &str,
        progress: &ProgressSender,
    ) -> Result<DownloadedModel> {
        let fail = |reason: String| Error::DownloadFailed {
            model_id: spec.id.clone(),
            reason,
        };

        tracing::info!(model_id = %spec.id, repo = %repo_id, "Starting model download via hf-hub");

        let repo = self.api.model(repo_id.to_string());
        let info = repo
            .info()
            .await
            .map_err(|e| fail(format!("Failed to fetch repository info: {}", e)))?;

        let files: Vec<String> = info.siblings.into_iter().map(|s| s.rfilename).collect();
        if files.is_empty() {
            return Err(fail(format!("Repository {} has no files", repo_id)));
        }

        let total_files = files.len();
        let mut completed_bytes = 0u64;
        let mut files_path: Option<PathBuf> = None;

        for (index, file) in files.iter().enumerate() {
            tracing::debug!(model_id = %spec.id, file = %file, "Downloading file");
            let path = repo
                .get(file)
                .await
                .map_err(|e| fail(format!("Failed to download {}: {}", file, e)))?;

            if let Ok(metadata) = tokio::fs::metadata(&path).await {
                completed_bytes += metadata.len();
            }
            if files_path.is_none() {
                files_path = hub_model_root(&path);
            }

            // Receiver may already be gone if the caller stopped listening
            let _ = progress.send(file_progress(index, total_files, completed_bytes, file));
        }

        tracing::info!(
            model_id = %spec.id,
            files = total_files,
            size_in_bytes = completed_bytes,
            "Model download complete"
        );

        Ok(DownloadedModel {
            size_in_bytes: completed_bytes,
            files_path,
        })
    }

    async fn measure_local(
        &self,
        spec: &ModelSpec,
        path: &Path,
        progress: &ProgressSender,
    ) -> Result<DownloadedModel> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(Error::DownloadFailed {
                model_id: spec.id.clone(),
                reason: format!("Local model not found at {}", path.display()),
            });
        }

        let owned = path.to_path_buf();
        let size_in_bytes = tokio::task::spawn_blocking(move || path_size(&owned))
            .await
            .map_err(|e| Error::DownloadFailed {
                model_id: spec.id.clone(),
                reason: format!("Failed to measure local model: {}", e),
            })?;

        let _ = progress.send(DownloadProgress::finished(size_in_bytes));

        // Local files are owned by the user; never delete them
        Ok(DownloadedModel {
            size_in_bytes,
            files_path: None,
        })
    }
}

#[async_trait]
impl ModelDownloadDelegate for HubModelDownloader {
    async fn download(&self, spec: &ModelSpec, progress: ProgressSender) -> Result<DownloadedModel> {
        match &spec.base {
            ModelSource::HuggingFace { id } => self.download_from_hub(spec, id, &progress).await,
            ModelSource::Local { path } => self.measure_local(spec, path, &progress).await,
        }
    }
}

/// Event for the `index`th of `total_files` finished files; the total is unknown
fn file_progress(
    index: usize,
    total_files: usize,
    completed_bytes: u64,
    file: &str,
) -> DownloadProgress {
    DownloadProgress {
        fraction: (index + 1) as f64 / total_files as f64,
        completed_bytes,
        total_bytes: 0,
        current_file: Some(file.to_string()),
    }
}

/// `.../models--org--name` directory that owns a cached hub file
fn hub_model_root(file: &Path) -> Option<PathBuf> {
    file.ancestors()
        .find(|ancestor| {
            ancestor
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("models--"))
        })
        .map(Path::to_path_buf)
}

/// Size of a file, or of everything under a directory
fn path_size(path: &Path) -> u64 {
    if path.is_file() {
        return std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    }

    let mut size = 0;
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                size += path_size(&path);
            } else if let Ok(metadata) = std::fs::metadata(&path) {
                size += metadata.len();
            }
        }
    }

    size
}
