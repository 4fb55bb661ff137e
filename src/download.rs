//! Resumable background downloads keyed by URL
//!
//! All resumption state lives in this struct, keyed by URL. Nothing depends
//! on a live task handle, so a transfer can be paused by one caller and
//! resumed by another after the original future has gone away.
//!
//! Resume data is held in memory only and is lost when the downloader is
//! dropped.

use crate::error::{BackgroundDownloadError, Result};
use crate::metrics;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use url::Url;

/// Per-URL transfer state
///
/// [`BackgroundDownloader`] only ever retains `Downloading` and `Paused`.
/// A finished transfer is reported through the return value of
/// [`BackgroundDownloader::download`] and its URL stops being tracked, so
/// `Completed` and `Failed` are never returned by `state`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadState {
    Downloading,
    Paused { resume_data: Vec<u8> },
    Completed { local_path: PathBuf },
    Failed { reason: String },
}

/// Transport that performs resumable transfers
#[async_trait]
pub trait BackgroundDownloadDelegate: Send + Sync {
    /// Fetch `url`, continuing from `resume_data` when given
    async fn start_download(&self, url: &Url, resume_data: Option<Vec<u8>>) -> Result<PathBuf>;

    /// Stop the transfer for `url` and hand back whatever resume data it produced
    async fn cancel_download(&self, url: &Url) -> Result<Option<Vec<u8>>>;
}

#[derive(Default)]
struct Transfers {
    active: HashMap<Url, DownloadState>,
    resume_data: HashMap<Url, Vec<u8>>,
}

/// Pausable, resumable and cancellable downloads
///
/// State transitions happen in short critical sections. The delegate is
/// always called without the lock held.
pub struct BackgroundDownloader {
    storage_directory: PathBuf,
    delegate: Arc<dyn BackgroundDownloadDelegate>,
    transfers: Mutex<Transfers>,
}

impl BackgroundDownloader {
    pub fn new(storage_directory: PathBuf, delegate: Arc<dyn BackgroundDownloadDelegate>) -> Self {
        Self {
            storage_directory,
            delegate,
            transfers: Mutex::new(Transfers::default()),
        }
    }

    /// Directory transfers are expected to land in
    pub fn storage_directory(&self) -> &Path {
        &self.storage_directory
    }

    fn transfers(&self) -> MutexGuard<'_, Transfers> {
        // State stays consistent across a panicking holder; every section is a single map update
        self.transfers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Download `url`, resuming from stored resume data if any
    ///
    /// On success the URL is no longer tracked and its resume data is gone.
    /// On failure active tracking is cleared and the error propagates. If the
    /// returned future is dropped mid-transfer the URL stops being tracked as
    /// downloading. In both cases a concurrent pause keeps its entry.
    pub async fn download(&self, url: &Url) -> Result<PathBuf> {
        let resume_data = {
            let mut transfers = self.transfers();
            transfers
                .active
                .insert(url.clone(), DownloadState::Downloading);
            transfers.resume_data.get(url).cloned()
        };

        let resuming = resume_data.is_some();
        tracing::info!(url = %url, resuming, "Starting background download");

        let in_flight = InFlight {
            downloader: self,
            url,
            armed: true,
        };
        let outcome = self.delegate.start_download(url, resume_data).await;
        in_flight.disarm();

        match outcome {
            Ok(local_path) => {
                {
                    let mut transfers = self.transfers();
                    transfers.active.remove(url);
                    transfers.resume_data.remove(url);
                }
                tracing::info!(url = %url, path = ?local_path, "Background download completed");
                metrics::record_background_download("completed");
                Ok(local_path)
            }
            Err(err) => {
                self.clear_if_downloading(url);
                if err.is_cancelled() {
                    tracing::info!(url = %url, "Background download stopped");
                } else {
                    tracing::warn!(url = %url, error = %err, "Background download failed");
                }
                metrics::record_background_download("failed");
                Err(err)
            }
        }
    }

    /// Drop `url` from active tracking unless a pause has taken it over
    fn clear_if_downloading(&self, url: &Url) -> bool {
        let mut transfers = self.transfers();
        if matches!(transfers.active.get(url), Some(DownloadState::Downloading)) {
            transfers.active.remove(url);
            return true;
        }
        false
    }

    /// Pause an active download, keeping its resume data
    ///
    /// Empty resume data still counts, so `resume` stays possible.
    pub async fn pause(&self, url: &Url) -> Result<()> {
        if !self.transfers().active.contains_key(url) {
            return Err(BackgroundDownloadError::NotDownloading.into());
        }

        let data = self.delegate.cancel_download(url).await?.unwrap_or_default();
        let bytes = data.len();

        {
            let mut transfers = self.transfers();
            transfers.resume_data.insert(url.clone(), data.clone());
            transfers
                .active
                .insert(url.clone(), DownloadState::Paused { resume_data: data });
        }

        tracing::info!(url = %url, resume_bytes = bytes, "Background download paused");
        metrics::record_background_download("paused");
        Ok(())
    }

    /// Continue a paused download
    pub async fn resume(&self, url: &Url) -> Result<PathBuf> {
        if !self.has_resume_data(url) {
            return Err(BackgroundDownloadError::NoResumeData.into());
        }

        tracing::info!(url = %url, "Resuming background download");
        self.download(url).await
    }

    /// Stop tracking `url`; a no-op when nothing is tracked
    ///
    /// Delegate cancel failures are logged and ignored.
    pub async fn cancel(&self, url: &Url) {
        let tracked = self.transfers().active.contains_key(url);

        if tracked {
            if let Err(e) = self.delegate.cancel_download(url).await {
                tracing::warn!(url = %url, error = %e, "Delegate cancel failed, dropping tracking anyway");
            }
        }

        let mut transfers = self.transfers();
        transfers.active.remove(url);
        transfers.resume_data.remove(url);
        drop(transfers);

        if tracked {
            tracing::info!(url = %url, "Background download cancelled");
            metrics::record_background_download("cancelled");
        }
    }

    /// Track `url` as downloading without starting a transfer
    pub fn mark_as_downloading(&self, url: &Url) {
        self.transfers()
            .active
            .insert(url.clone(), DownloadState::Downloading);
    }

    pub fn is_downloading(&self, url: &Url) -> bool {
        matches!(
            self.transfers().active.get(url),
            Some(DownloadState::Downloading)
        )
    }

    pub fn has_resume_data(&self, url: &Url) -> bool {
        self.transfers().resume_data.contains_key(url)
    }

    pub fn state(&self, url: &Url) -> Option<DownloadState> {
        self.transfers().active.get(url).cloned()
    }

    /// URLs currently in the `Downloading` state
    pub fn active_download_urls(&self) -> Vec<Url> {
        self.transfers()
            .active
            .iter()
            .filter(|(_, state)| matches!(state, DownloadState::Downloading))
            .map(|(url, _)| url.clone())
            .collect()
    }
}

/// Untracks a transfer whose `download` future was dropped before finishing
struct InFlight<'a> {
    downloader: &'a BackgroundDownloader,
    url: &'a Url,
    armed: bool,
}

impl InFlight<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed && self.downloader.clear_if_downloading(self.url) {
            tracing::info!(url = %self.url, "Background download abandoned");
            metrics::record_background_download("abandoned");
        }
    }
}
