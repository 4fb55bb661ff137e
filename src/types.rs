//! Value types describing models, adapters and transfer progress

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const GIB: u64 = 1024 * 1024 * 1024;

/// Where a base model's weights live
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelSource {
    /// Hugging Face Hub repository id (e.g. "mlx-community/Qwen3-0.6B-4bit")
    HuggingFace { id: String },
    /// Model directory on the local filesystem
    Local { path: PathBuf },
}

/// Where a LoRA adapter lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdapterSource {
    /// Asset attached to a GitHub release
    GitHubRelease {
        repo: String,
        tag: String,
        asset: String,
    },
    /// Hugging Face Hub repository id
    HuggingFace { id: String },
    /// Adapter file on the local filesystem
    Local { path: PathBuf },
}

impl AdapterSource {
    /// Deterministic, filesystem-safe key used by the adapter registry
    ///
    /// - release asset: `gh--{repo with "/" -> "--"}--{tag}--{asset}`
    /// - hub id: `hf--{id with "/" -> "--"}`
    /// - local: `local--{file name}`
    pub fn cache_key(&self) -> String {
        match self {
            Self::GitHubRelease { repo, tag, asset } => {
                format!("gh--{}--{}--{}", repo.replace('/', "--"), tag, asset)
            }
            Self::HuggingFace { id } => format!("hf--{}", id.replace('/', "--")),
            Self::Local { path } => format!("local--{}", file_name(path)),
        }
    }

    /// Version signal carried by the source, if any
    pub fn version(&self) -> Option<&str> {
        match self {
            Self::GitHubRelease { tag, .. } => Some(tag),
            Self::HuggingFace { id } => Some(id),
            Self::Local { .. } => None,
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Identity and configuration of a base model
///
/// Equality is structural: two specs are equal only if every field matches.
/// The model switcher relies on this to decide whether a model is already
/// resident.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: String,
    pub base: ModelSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter: Option<AdapterSource>,
    /// Maximum context length in tokens
    pub context_length: u32,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    /// Estimated footprint of the quantized model during inference
    pub estimated_memory_bytes: u64,
}

impl ModelSpec {
    /// Spec for a Hugging Face hosted model with empty description
    pub fn hugging_face(
        id: impl Into<String>,
        repo_id: impl Into<String>,
        context_length: u32,
        estimated_memory_bytes: u64,
    ) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            base: ModelSource::HuggingFace { id: repo_id.into() },
            adapter: None,
            context_length,
            description: String::new(),
            estimated_memory_bytes,
        }
    }

    /// Attach an adapter to this spec
    pub fn with_adapter(mut self, adapter: AdapterSource) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn size_tier(&self) -> ModelSizeTier {
        ModelSizeTier::from_bytes(self.estimated_memory_bytes)
    }
}

/// Coarse size class of a model's estimated memory footprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSizeTier {
    /// Under 1 GiB
    Tiny,
    /// 1 to 3 GiB
    Small,
    /// 3 to 8 GiB
    Medium,
    /// 8 to 20 GiB
    Large,
    /// 20 GiB and above
    ExtraLarge,
}

impl ModelSizeTier {
    pub fn from_bytes(bytes: u64) -> Self {
        match bytes {
            b if b < GIB => Self::Tiny,
            b if b < 3 * GIB => Self::Small,
            b if b < 8 * GIB => Self::Medium,
            b if b < 20 * GIB => Self::Large,
            _ => Self::ExtraLarge,
        }
    }
}

impl std::fmt::Display for ModelSizeTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tiny => write!(f, "Tiny (< 1 GB)"),
            Self::Small => write!(f, "Small (1-3 GB)"),
            Self::Medium => write!(f, "Medium (3-8 GB)"),
            Self::Large => write!(f, "Large (8-20 GB)"),
            Self::ExtraLarge => write!(f, "Extra Large (20 GB+)"),
        }
    }
}

/// One progress report from a model download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    /// Fraction complete, 0.0 to 1.0
    pub fraction: f64,
    pub completed_bytes: u64,
    /// `0` while the total is not known yet
    pub total_bytes: u64,
    /// File currently being transferred, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
}

impl DownloadProgress {
    /// First event of every progress sequence
    pub fn started() -> Self {
        Self {
            fraction: 0.0,
            completed_bytes: 0,
            total_bytes: 0,
            current_file: None,
        }
    }

    /// Last event of a successful progress sequence
    pub fn finished(total_bytes: u64) -> Self {
        Self {
            fraction: 1.0,
            completed_bytes: total_bytes,
            total_bytes,
            current_file: None,
        }
    }
}

/// Sampling parameters passed through to the inference backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.7,
            top_p: 0.9,
        }
    }
}
