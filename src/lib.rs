//! LLM Cache Manager - on-device model and adapter lifecycle
//!
//! Tracks which base models and LoRA adapters are on disk, drives resumable
//! downloads, bounds how many models stay resident in an inference backend,
//! and turns device memory figures into admission policy.

pub mod adapters;
pub mod config;
pub mod download;
pub mod error;
pub mod logging;
pub mod memory;
pub mod metrics;
pub mod models;
pub mod store;
pub mod switcher;
pub mod transfer;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use adapters::{AdapterInfo, AdapterNetworkDelegate, AdapterRegistry, AdapterResolver};
pub use config::ManagerConfig;
pub use download::{BackgroundDownloadDelegate, BackgroundDownloader, DownloadState};
pub use error::{BackgroundDownloadError, Error, Result};
pub use memory::{
    DeviceMemoryTier, LowMemorySignal, MemoryMonitor, MemoryProvider, MemoryWarningChannel,
    SystemMemoryProvider,
};
pub use models::{CachedModelInfo, DownloadedModel, ModelDownloadDelegate, ModelRegistry};
pub use store::{JsonFileStore, RegistryStore};
pub use switcher::{InferenceBackend, LoadedModelEntry, ModelSwitcher, ProgressHandler};
pub use transfer::HttpTransfer;
pub use types::{
    AdapterSource, DownloadProgress, GenerationConfig, ModelSizeTier, ModelSource, ModelSpec,
};
