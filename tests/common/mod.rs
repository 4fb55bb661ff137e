//! Shared fakes for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use llm_cache_manager::models::ProgressSender;
use llm_cache_manager::switcher::TokenStream;
use llm_cache_manager::{
    AdapterNetworkDelegate, BackgroundDownloadDelegate, DownloadProgress, DownloadedModel, Error,
    GenerationConfig, InferenceBackend, MemoryProvider, ModelDownloadDelegate, ModelSpec, Result,
};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use url::Url;

pub const GIB: u64 = 1024 * 1024 * 1024;

pub fn spec(id: &str) -> ModelSpec {
    ModelSpec::hugging_face(id, format!("mlx-community/{}", id), 4096, GIB)
}

/// Writes a weights directory under `root` and reports its size
pub struct DiskModelDownloader {
    pub root: PathBuf,
}

#[async_trait]
impl ModelDownloadDelegate for DiskModelDownloader {
    async fn download(&self, spec: &ModelSpec, progress: ProgressSender) -> Result<DownloadedModel> {
        let dir = self.root.join(format!("models--{}", spec.id));
        let fail = |e: std::io::Error| Error::DownloadFailed {
            model_id: spec.id.clone(),
            reason: e.to_string(),
        };

        tokio::fs::create_dir_all(&dir).await.map_err(fail)?;
        let files = ["config.json", "model.safetensors"];
        for (index, file) in files.iter().enumerate() {
            tokio::fs::write(dir.join(file), vec![0u8; 512])
                .await
                .map_err(fail)?;
            let _ = progress.send(DownloadProgress {
                fraction: (index + 1) as f64 / files.len() as f64,
                completed_bytes: 512 * (index as u64 + 1),
                total_bytes: 1024,
                current_file: Some(file.to_string()),
            });
        }

        Ok(DownloadedModel {
            size_in_bytes: 1024,
            files_path: Some(dir),
        })
    }
}

/// Writes the asset name into the destination file
#[derive(Default)]
pub struct FileAdapterNetwork {
    pub downloads: AtomicUsize,
}

#[async_trait]
impl AdapterNetworkDelegate for FileAdapterNetwork {
    async fn download_github_release(
        &self,
        _repo: &str,
        tag: &str,
        asset: &str,
        destination: &Path,
    ) -> Result<()> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        write_file(destination, format!("{}@{}", asset, tag)).await
    }

    async fn download_hugging_face(&self, id: &str, destination: &Path) -> Result<()> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        write_file(destination, id.to_string()).await
    }
}

async fn write_file(destination: &Path, content: String) -> Result<()> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::AdapterMergeFailed {
                reason: e.to_string(),
            })?;
    }
    tokio::fs::write(destination, content)
        .await
        .map_err(|e| Error::AdapterMergeFailed {
            reason: e.to_string(),
        })
}

/// Completes instantly; cancel hands back fixed resume bytes
pub struct InstantTransfer {
    pub storage: PathBuf,
    pub resume_seen: Mutex<Vec<Option<Vec<u8>>>>,
}

impl InstantTransfer {
    pub fn new(storage: PathBuf) -> Self {
        Self {
            storage,
            resume_seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl BackgroundDownloadDelegate for InstantTransfer {
    async fn start_download(&self, url: &Url, resume_data: Option<Vec<u8>>) -> Result<PathBuf> {
        self.resume_seen.lock().unwrap().push(resume_data);
        let name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or("download");
        Ok(self.storage.join(name))
    }

    async fn cancel_download(&self, _url: &Url) -> Result<Option<Vec<u8>>> {
        Ok(Some(b"resume-token".to_vec()))
    }
}

/// Backend that holds a single model
#[derive(Default)]
pub struct SingleSlotBackend {
    pub current: Mutex<Option<ModelSpec>>,
    pub loads: AtomicUsize,
    pub unloads: AtomicUsize,
}

impl SingleSlotBackend {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unloads(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceBackend for SingleSlotBackend {
    async fn load_model(&self, spec: &ModelSpec) -> Result<()> {
        *self.current.lock().unwrap() = Some(spec.clone());
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn generate(&self, prompt: &str, _config: &GenerationConfig) -> TokenStream {
        let echo: Vec<Result<String>> = prompt
            .split_whitespace()
            .map(|token| Ok(token.to_string()))
            .collect();
        futures::stream::iter(echo).boxed()
    }

    async fn unload_model(&self) {
        *self.current.lock().unwrap() = None;
        self.unloads.fetch_add(1, Ordering::SeqCst);
    }

    async fn is_loaded(&self) -> bool {
        self.current.lock().unwrap().is_some()
    }

    async fn current_model(&self) -> Option<ModelSpec> {
        self.current.lock().unwrap().clone()
    }
}

pub struct StaticMemory {
    pub total: u64,
    pub available: u64,
}

impl MemoryProvider for StaticMemory {
    fn total_memory_bytes(&self) -> u64 {
        self.total
    }

    fn available_memory_bytes(&self) -> u64 {
        self.available
    }
}
