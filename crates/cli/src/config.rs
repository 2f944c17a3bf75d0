//! Persistent defaults for the scoring CLI.
//!
//! Values are resolved with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (~/.config/llava-reward/config.toml)
//! 3. Built-in defaults (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL_PATH: &str = "liuhaotian/llava-v1.5-7b";
pub const DEFAULT_DEVICE: &str = "cuda";
pub const DEFAULT_DTYPE: &str = "auto";

/// Configuration stored in TOML format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Checkpoint directory or HuggingFace repo id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_path: Option<String>,

    /// Base checkpoint for projector-only or delta releases.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_base: Option<String>,

    /// Compute device (cpu, cuda[:N], metal[:N]).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    /// Weight dtype (auto, fp32, fp16, bf16).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,

    /// Conversation template name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conv_mode: Option<String>,

    /// Explicit tokenizer.json path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokenizer: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl CliConfig {
    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("llava-reward").join("config.toml"))
    }

    /// Load configuration from the default path, falling back to empty.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        fs::write(path, content).map_err(ConfigError::Io)
    }

    /// Merge with another config, preferring values from `other`.
    pub fn merge(&mut self, other: &CliConfig) {
        fn take(slot: &mut Option<String>, value: &Option<String>) {
            if value.is_some() {
                slot.clone_from(value);
            }
        }
        take(&mut self.model_path, &other.model_path);
        take(&mut self.model_base, &other.model_base);
        take(&mut self.device, &other.device);
        take(&mut self.dtype, &other.dtype);
        take(&mut self.conv_mode, &other.conv_mode);
        take(&mut self.tokenizer, &other.tokenizer);
        take(&mut self.log_level, &other.log_level);
    }

    pub fn model_path_or_default(&self) -> &str {
        self.model_path.as_deref().unwrap_or(DEFAULT_MODEL_PATH)
    }

    pub fn device_or_default(&self) -> &str {
        self.device.as_deref().unwrap_or(DEFAULT_DEVICE)
    }

    pub fn dtype_or_default(&self) -> &str {
        self.dtype.as_deref().unwrap_or(DEFAULT_DTYPE)
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
    /// No per-user config directory on this platform.
    NoConfigDir,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {}", e),
            ConfigError::NoConfigDir => write!(f, "No config directory available"),
        }
    }
}

impl std::error::Error for ConfigError {}
