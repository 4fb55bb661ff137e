//! Base model cache
//!
//! Provides functionality for:
//! - Tracking downloaded models in a persisted registry
//! - Downloading models with progress and cancellation
//! - Fetching model files from HuggingFace Hub

pub mod hub;
pub mod registry;

pub use hub::HubModelDownloader;
pub use registry::{
    CachedModelInfo, DownloadedModel, ModelDownloadDelegate, ModelRegistry, ProgressSender,
};
