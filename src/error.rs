//! Error types shared by the registries, downloader, switcher and memory monitor

use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the cache and lifecycle components
///
/// Nothing in this crate retries on its own: every variant reaches the
/// immediate caller unchanged.
#[derive(Debug, Error)]
pub enum Error {
    /// A transfer failed
    #[error("download of '{model_id}' failed: {reason}")]
    DownloadFailed { model_id: String, reason: String },

    /// The inference backend could not load a model
    #[error("loading '{model_id}' failed: {reason}")]
    LoadFailed { model_id: String, reason: String },

    /// Policy check: the model does not fit in device memory
    #[error("insufficient memory: {required} bytes required, {available} bytes available")]
    InsufficientMemory { required: u64, available: u64 },

    /// Policy check: not enough storage for the download
    #[error("insufficient storage: {required} bytes required, {available} bytes available")]
    InsufficientStorage { required: u64, available: u64 },

    /// The backend is already loading a model
    #[error("a model load is already in progress")]
    LoadInProgress,

    /// The operation needs a resident model and none is loaded
    #[error("no model is loaded")]
    ModelNotLoaded,

    /// Cooperative cancellation, never produced by an ordinary failure
    #[error("operation cancelled")]
    Cancelled,

    /// Adapter resolution failed (missing local file or failed fetch)
    #[error("adapter merge failed: {reason}")]
    AdapterMergeFailed { reason: String },

    #[error("unsupported model format: {0}")]
    UnsupportedModelFormat(String),

    #[error(transparent)]
    BackgroundDownload(#[from] BackgroundDownloadError),

    /// The registry snapshot could not be written
    #[error("registry persistence failed: {0:#}")]
    Persistence(#[source] anyhow::Error),
}

impl Error {
    /// True when the error came from cooperative cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Misuse and I/O errors specific to [`BackgroundDownloader`](crate::download::BackgroundDownloader)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackgroundDownloadError {
    #[error("no resume data stored for this URL")]
    NoResumeData,

    #[error("URL is not currently downloading")]
    NotDownloading,

    #[error("failed to persist resume data: {reason}")]
    ResumeDataPersistenceFailed { reason: String },
}
