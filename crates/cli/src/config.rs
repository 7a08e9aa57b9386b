//! Configuration persistence for the tensor-lora CLI.
//!
//! Configuration is loaded with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (~/.config/tensor-lora/config.toml)
//! 3. Default values (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tensor_lora_core::lora::{LoraConfig, LoraConfigError, LoraDtype};

/// Persistent configuration stored in TOML format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Maximum LoRA rank.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_lora_rank: Option<usize>,

    /// Adapters active in a single batch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_loras: Option<usize>,

    /// Adapters kept in the CPU cache.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cpu_loras: Option<usize>,

    /// Vocabulary rows reserved for adapter-added tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lora_extra_vocab_size: Option<usize>,

    /// Data type for LoRA weights (auto, fp16, bf16, fp32).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lora_dtype: Option<String>,

    /// Allow adapters with bias terms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bias_enabled: Option<bool>,

    /// Base model architecture (e.g. LlamaForCausalLM).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,

    /// Base model vocabulary size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vocab_size: Option<usize>,

    /// Base model context length.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_position_embeddings: Option<usize>,
}

impl CliConfig {
    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("tensor-lora").join("config.toml"))
    }

    /// Load configuration from the default path.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    /// Load configuration from a specific path.
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

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }

        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        fs::write(path, content).map_err(ConfigError::Io)?;
        Ok(())
    }

    /// Merge with another config, preferring values from `other`.
    pub fn merge(&mut self, other: &CliConfig) {
        if other.max_lora_rank.is_some() {
            self.max_lora_rank = other.max_lora_rank;
        }
        if other.max_loras.is_some() {
            self.max_loras = other.max_loras;
        }
        if other.max_cpu_loras.is_some() {
            self.max_cpu_loras = other.max_cpu_loras;
        }
        if other.lora_extra_vocab_size.is_some() {
            self.lora_extra_vocab_size = other.lora_extra_vocab_size;
        }
        if other.lora_dtype.is_some() {
            self.lora_dtype = other.lora_dtype.clone();
        }
        if other.bias_enabled.is_some() {
            self.bias_enabled = other.bias_enabled;
        }
        if other.architecture.is_some() {
            self.architecture = other.architecture.clone();
        }
        if other.vocab_size.is_some() {
            self.vocab_size = other.vocab_size;
        }
        if other.max_position_embeddings.is_some() {
            self.max_position_embeddings = other.max_position_embeddings;
        }
    }

    /// Engine LoRA settings, with defaults for unset fields.
    pub fn to_lora_config(&self) -> Result<LoraConfig, ConfigError> {
        let defaults = LoraConfig::default();
        let lora_dtype = match self.lora_dtype.as_deref() {
            Some(s) => LoraDtype::parse(s).ok_or_else(|| {
                ConfigError::InvalidValue(format!(
                    "lora_dtype '{s}' is not supported; use auto, fp16, bf16 or fp32"
                ))
            })?,
            None => defaults.lora_dtype,
        };

        let config = LoraConfig {
            max_lora_rank: self.max_lora_rank.unwrap_or(defaults.max_lora_rank),
            max_loras: self.max_loras.unwrap_or(defaults.max_loras),
            max_cpu_loras: self.max_cpu_loras.or(defaults.max_cpu_loras),
            lora_extra_vocab_size: self
                .lora_extra_vocab_size
                .unwrap_or(defaults.lora_extra_vocab_size),
            lora_dtype,
            bias_enabled: self.bias_enabled.unwrap_or(defaults.bias_enabled),
        };
        config.verify().map_err(ConfigError::Lora)?;
        Ok(config)
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading/writing config file.
    Io(std::io::Error),
    /// Error parsing TOML.
    Parse(toml::de::Error),
    /// Error serializing to TOML.
    Serialize(toml::ser::Error),
    /// No config directory available.
    NoConfigDir,
    /// A value outside its accepted set.
    InvalidValue(String),
    /// Inconsistent LoRA capacity settings.
    Lora(LoraConfigError),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {}", e),
            ConfigError::NoConfigDir => write!(f, "No config directory available"),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid value: {}", msg),
            ConfigError::Lora(e) => write!(f, "Invalid LoRA config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
