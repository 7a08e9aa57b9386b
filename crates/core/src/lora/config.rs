//! Engine-side LoRA capacity settings.

use candle_core::DType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ranks the engine's LoRA kernels are compiled for.
pub const SUPPORTED_MAX_LORA_RANKS: [usize; 9] = [1, 8, 16, 32, 64, 128, 256, 320, 512];

/// Errors from [`LoraConfig::verify`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoraConfigError {
    #[error("max_lora_rank ({0}) is not a supported LoRA rank")]
    UnsupportedMaxRank(usize),
    #[error("max_loras ({0}) must be >= 1")]
    NoLoraSlots(usize),
    #[error("max_cpu_loras ({max_cpu_loras}) must be >= max_loras ({max_loras})")]
    CpuCacheTooSmall {
        max_cpu_loras: usize,
        max_loras: usize,
    },
}

/// Data type for LoRA weights.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoraDtype {
    /// Follow the base model's dtype.
    #[default]
    Auto,
    #[serde(alias = "float16", alias = "half")]
    Fp16,
    #[serde(alias = "bfloat16")]
    Bf16,
    #[serde(alias = "float32", alias = "float")]
    Fp32,
}

impl LoraDtype {
    /// Parse the names accepted on the command line and in config files.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Self::Auto),
            "fp16" | "float16" | "half" => Some(Self::Fp16),
            "bf16" | "bfloat16" => Some(Self::Bf16),
            "fp32" | "float32" | "float" => Some(Self::Fp32),
            _ => None,
        }
    }

    /// Resolve to a concrete dtype, using `model_dtype` for `Auto`.
    pub fn resolve(self, model_dtype: DType) -> DType {
        match self {
            Self::Auto => model_dtype,
            Self::Fp16 => DType::F16,
            Self::Bf16 => DType::BF16,
            Self::Fp32 => DType::F32,
        }
    }
}

/// LoRA capacity of the serving engine.
///
/// Adapters are validated against these limits before their weights are
/// materialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraConfig {
    /// Largest adapter rank the engine accepts.
    pub max_lora_rank: usize,
    /// Adapters that can be active in a single batch.
    pub max_loras: usize,
    /// Adapters kept resident in the CPU cache. Defaults to `max_loras`.
    pub max_cpu_loras: Option<usize>,
    /// Vocabulary rows reserved for adapter-added tokens.
    pub lora_extra_vocab_size: usize,
    /// Data type of loaded LoRA weights.
    pub lora_dtype: LoraDtype,
    /// Whether adapters may carry bias terms.
    pub bias_enabled: bool,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            max_lora_rank: 16,
            max_loras: 1,
            max_cpu_loras: None,
            lora_extra_vocab_size: 256,
            lora_dtype: LoraDtype::Auto,
            bias_enabled: false,
        }
    }
}

impl LoraConfig {
    /// Check the settings are self-consistent.
    pub fn verify(&self) -> Result<(), LoraConfigError> {
        if !SUPPORTED_MAX_LORA_RANKS.contains(&self.max_lora_rank) {
            return Err(LoraConfigError::UnsupportedMaxRank(self.max_lora_rank));
        }
        if self.max_loras < 1 {
            return Err(LoraConfigError::NoLoraSlots(self.max_loras));
        }
        if let Some(max_cpu_loras) = self.max_cpu_loras {
            if max_cpu_loras < self.max_loras {
                return Err(LoraConfigError::CpuCacheTooSmall {
                    max_cpu_loras,
                    max_loras: self.max_loras,
                });
            }
        }
        Ok(())
    }

    /// Capacity of the CPU-side adapter cache.
    pub fn cpu_capacity(&self) -> usize {
        self.max_cpu_loras.unwrap_or(self.max_loras)
    }
}
