//! PEFT adapter configuration (`adapter_config.json`).

use std::path::Path;

use serde::Deserialize;
use serde_json::{Map, Value};

use super::config::LoraConfig;
use super::loader::LoraLoadError;

const REQUIRED_FIELDS: [&str; 3] = ["r", "lora_alpha", "target_modules"];

/// `target_modules` is either an explicit list or a regex over module names.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TargetModules {
    List(Vec<String>),
    Pattern(String),
}

impl TargetModules {
    /// Module names as written in the config. A pattern yields itself.
    pub fn names(&self) -> Vec<String> {
        match self {
            Self::List(names) => names.clone(),
            Self::Pattern(pattern) => vec![pattern.clone()],
        }
    }
}

/// Hyperparameters of a trained adapter.
#[derive(Debug, Clone, Deserialize)]
pub struct PeftConfig {
    /// LoRA rank (r parameter).
    pub r: usize,
    /// Scaling parameter (alpha).
    pub lora_alpha: f32,
    /// Which modules to apply LoRA to.
    pub target_modules: TargetModules,
    /// Dropout probability (not used at inference).
    #[serde(default)]
    pub lora_dropout: f32,
    /// Bias handling: "none", "all", "lora_only".
    #[serde(default = "default_bias")]
    pub bias: String,
    /// Fully fine-tuned modules saved next to the adapter. Unsupported.
    #[serde(default)]
    pub modules_to_save: Option<Vec<String>>,
    /// Use rank-stabilized LoRA scaling.
    #[serde(default)]
    pub use_rslora: bool,
    /// Weight-decomposed LoRA. Unsupported.
    #[serde(default)]
    pub use_dora: bool,
    /// Context length the adapter was trained for (long-context LoRA).
    #[serde(default)]
    pub context_length: usize,
    /// Base model name/path for validation.
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
    /// Base model's max position embeddings, injected at load time.
    #[serde(default)]
    pub vllm_max_position_embeddings: Option<usize>,
}

fn default_bias() -> String {
    "none".to_string()
}

impl PeftConfig {
    /// Parse from an in-memory config mapping.
    ///
    /// Unknown keys are ignored; missing required keys are reported together.
    pub fn from_dict(config: &Map<String, Value>) -> Result<Self, LoraLoadError> {
        let missing: Vec<String> = REQUIRED_FIELDS
            .iter()
            .filter(|field| !config.contains_key(**field))
            .map(|field| field.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(LoraLoadError::MissingConfigFields(missing));
        }

        let peft: Self = serde_json::from_value(Value::Object(config.clone()))
            .map_err(|e| LoraLoadError::ConfigParse(e.to_string()))?;
        if peft.r == 0 {
            return Err(LoraLoadError::InvalidConfig(
                "LoRA rank r must be greater than 0.".to_string(),
            ));
        }
        if peft.use_rslora {
            tracing::info!(rank = peft.r, "Loading LoRA weights trained with rsLoRA");
        }
        Ok(peft)
    }

    /// Load `adapter_config.json` from a checkpoint directory.
    pub fn from_local_dir(
        path: &Path,
        max_position_embeddings: Option<usize>,
    ) -> Result<Self, LoraLoadError> {
        let config_path = path.join("adapter_config.json");
        if !config_path.exists() {
            return Err(LoraLoadError::ConfigNotFound(
                config_path.display().to_string(),
            ));
        }

        let config_str = std::fs::read_to_string(&config_path)?;
        let mut config: Map<String, Value> = serde_json::from_str(&config_str)
            .map_err(|e| LoraLoadError::ConfigParse(e.to_string()))?;
        config.insert(
            "vllm_max_position_embeddings".to_string(),
            max_position_embeddings.map_or(Value::Null, Value::from),
        );
        Self::from_dict(&config)
    }

    /// Compute the scaling factor for LoRA.
    ///
    /// For standard LoRA: scale = alpha / rank
    /// For rsLoRA: scale = alpha / sqrt(rank)
    pub fn scaling(&self) -> f32 {
        if self.use_rslora {
            self.lora_alpha / (self.r as f32).sqrt()
        } else {
            self.lora_alpha / self.r as f32
        }
    }

    /// Long-context scaling factor, when `context_length` is set.
    pub fn long_context_scaling_factor(&self) -> Option<f32> {
        if self.context_length == 0 {
            return None;
        }
        let max_pos = self
            .vllm_max_position_embeddings
            .filter(|&n| n > 0)
            .unwrap_or(self.context_length);
        Some((self.context_length as f32 / max_pos as f32).ceil())
    }

    /// Reject adapters the engine cannot serve.
    ///
    /// All violations are reported in one error.
    pub fn validate_legal(&self, lora_config: &LoraConfig) -> Result<(), LoraLoadError> {
        let mut errors = Vec::new();
        if self.modules_to_save.as_ref().is_some_and(|m| !m.is_empty()) {
            errors.push("only supports modules_to_save being None.".to_string());
        }
        if self.use_dora {
            errors.push("does not yet support DoRA.".to_string());
        }
        if self.r > lora_config.max_lora_rank {
            errors.push(format!(
                "LoRA rank {} is greater than max_lora_rank {}.",
                self.r, lora_config.max_lora_rank
            ));
        }
        if self.bias != "none" && !lora_config.bias_enabled {
            errors.push("Adapter bias cannot be used without bias_enabled.".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(LoraLoadError::InvalidConfig(errors.join(" ")))
        }
    }
}
