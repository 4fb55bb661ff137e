//! Configuration structures and loading logic

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main manager configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ManagerConfig {
    /// Base model registry directory
    pub models_dir: PathBuf,
    /// Adapter registry directory
    pub adapters_dir: PathBuf,
    /// Landing directory for background transfers
    pub downloads_dir: PathBuf,
    /// Number of models the switcher keeps tracked
    pub max_loaded_models: usize,
    pub logging: LoggingConfig,
    pub memory: MemoryConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            models_dir: default_data_dir().join("models"),
            adapters_dir: default_data_dir().join("adapters"),
            downloads_dir: default_data_dir().join("downloads"),
            max_loaded_models: default_max_loaded_models(),
            logging: LoggingConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(dir) = std::env::var("LLM_CACHE_MODELS_DIR") {
            config.models_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("LLM_CACHE_ADAPTERS_DIR") {
            config.adapters_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("LLM_CACHE_DOWNLOADS_DIR") {
            config.downloads_dir = PathBuf::from(dir);
        }
        if let Ok(max) = std::env::var("LLM_CACHE_MAX_LOADED_MODELS") {
            config.max_loaded_models = max
                .parse()
                .context("Invalid LLM_CACHE_MAX_LOADED_MODELS value")?;
        }
        if let Ok(level) = std::env::var("LLM_CACHE_LOG_LEVEL") {
            config.logging.level = level;
        }

        Ok(config)
    }

    /// Validate configuration and create the configured directories
    pub fn validate(&self) -> Result<()> {
        if self.max_loaded_models == 0 {
            anyhow::bail!("max_loaded_models must be at least 1");
        }
        if self.memory.pressure_poll_interval_secs == 0 {
            anyhow::bail!("memory.pressure_poll_interval_secs must be at least 1");
        }

        for (name, dir) in [
            ("models_dir", &self.models_dir),
            ("adapters_dir", &self.adapters_dir),
            ("downloads_dir", &self.downloads_dir),
        ] {
            if dir.as_os_str().is_empty() {
                anyhow::bail!("{} cannot be empty", name);
            }
            if !dir.exists() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Cannot create {} directory: {:?}", name, dir))?;
            }
        }

        Ok(())
    }
}

/// Log output settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. "info" or "llm_cache_manager=debug"
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Low-memory watcher settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct MemoryConfig {
    /// Available memory below which a low-memory warning is raised
    pub low_memory_threshold_bytes: u64,
    pub pressure_poll_interval_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            low_memory_threshold_bytes: 512 * 1024 * 1024,
            pressure_poll_interval_secs: 5,
        }
    }
}

// Default functions
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("llm-local")
}
fn default_max_loaded_models() -> usize {
    1
}
