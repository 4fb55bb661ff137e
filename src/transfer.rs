//! HTTP transport for background downloads
//!
//! [`HttpTransfer`] streams a URL into `<storage>/<file>.part` and renames it
//! into place when the body is complete. Cancelling hands back a small token
//! recording how many bytes landed, and a later start with that token asks the
//! server for the rest with a `Range` request.

use crate::download::BackgroundDownloadDelegate;
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Opaque resume data handed back by [`HttpTransfer::cancel_download`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct ResumeToken {
    bytes_written: u64,
}

impl ResumeToken {
    fn encode(self) -> Vec<u8> {
        serde_json::to_vec(&self).unwrap_or_default()
    }

    fn decode(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}

/// Plain HTTP(S) downloads with `Range` based resumption
pub struct HttpTransfer {
    client: Client,
    storage_directory: PathBuf,
    in_flight: Mutex<HashMap<Url, CancellationToken>>,
}

impl HttpTransfer {
    pub fn new(storage_directory: PathBuf) -> Self {
        Self::with_client(Client::new(), storage_directory)
    }

    pub fn with_client(client: Client, storage_directory: PathBuf) -> Self {
        Self {
            client,
            storage_directory,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Where a finished download of `url` is placed
    pub fn destination(&self, url: &Url) -> PathBuf {
        let name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .unwrap_or("download");
        self.storage_directory.join(name)
    }

    fn partial_path(&self, url: &Url) -> PathBuf {
        let mut name = self.destination(url).into_os_string();
        name.push(".part");
        PathBuf::from(name)
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<Url, CancellationToken>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bytes already on disk that a resumed transfer can build on
    async fn resume_offset(&self, partial: &Path, resume_data: Option<&[u8]>) -> u64 {
        let Some(token) = resume_data.and_then(ResumeToken::decode) else {
            return 0;
        };
        match fs::metadata(partial).await {
            Ok(metadata) if metadata.len() == token.bytes_written => token.bytes_written,
            _ => {
                tracing::debug!(path = ?partial, "Partial file does not match resume data, restarting");
                0
            }
        }
    }

    async fn fetch(&self, url: &Url, resume_data: Option<&[u8]>) -> Result<PathBuf> {
        let fail = |reason: String| Error::DownloadFailed {
            model_id: url.to_string(),
            reason,
        };

        fs::create_dir_all(&self.storage_directory)
            .await
            .map_err(|e| fail(format!("Failed to create download directory: {}", e)))?;

        let destination = self.destination(url);
        let partial = self.partial_path(url);
        let offset = self.resume_offset(&partial, resume_data).await;

        let mut request = self.client.get(url.clone());
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }
        let response = request
            .send()
            .await
            .map_err(|e| fail(format!("Failed to start download: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(fail(format!("HTTP {}", status)));
        }

        // Servers that ignore the range send the whole body again
        let appending = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
        let mut file = if appending {
            OpenOptions::new().append(true).open(&partial).await
        } else {
            fs::File::create(&partial).await
        }
        .map_err(|e| fail(format!("Failed to open {}: {}", partial.display(), e)))?;

        tracing::debug!(url = %url, offset, appending, "Receiving download body");

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| fail(format!("Error reading download stream: {}", e)))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| fail(format!("Error writing download file: {}", e)))?;
        }
        file.flush()
            .await
            .map_err(|e| fail(format!("Error writing download file: {}", e)))?;
        drop(file);

        fs::rename(&partial, &destination)
            .await
            .map_err(|e| fail(format!("Failed to move download into place: {}", e)))?;

        Ok(destination)
    }
}

#[async_trait]
impl BackgroundDownloadDelegate for HttpTransfer {
    async fn start_download(&self, url: &Url, resume_data: Option<Vec<u8>>) -> Result<PathBuf> {
        let cancel = CancellationToken::new();
        self.in_flight().insert(url.clone(), cancel.clone());

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.fetch(url, resume_data.as_deref()) => result,
        };

        // A cancelled entry was already taken by `cancel_download`
        if !cancel.is_cancelled() {
            self.in_flight().remove(url);
        }

        result
    }

    async fn cancel_download(&self, url: &Url) -> Result<Option<Vec<u8>>> {
        let Some(cancel) = self.in_flight().remove(url) else {
            return Ok(None);
        };
        cancel.cancel();

        let bytes_written = fs::metadata(self.partial_path(url))
            .await
            .map(|metadata| metadata.len())
            .unwrap_or(0);
        tracing::debug!(url = %url, bytes_written, "Transfer cancelled");

        Ok(Some(ResumeToken { bytes_written }.encode()))
    }
}
