//! LoRA types and data structures.

use std::collections::HashMap;
use std::path::PathBuf;

use candle_core::Tensor;
use serde_json::{Map, Value};

use super::loader::LoraLoadError;

/// Request for a specific LoRA adapter.
///
/// An adapter comes either from a PEFT checkpoint on disk or from tensors
/// already held in memory (e.g. synchronised from a training actor).
#[derive(Debug, Clone)]
pub enum LoraRequest {
    /// Load from a checkpoint directory (or HuggingFace Hub repo id).
    Path(PathLoraRequest),
    /// Build directly from in-memory tensors.
    Tensors(TensorLoraRequest),
}

/// Checkpoint-backed adapter request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathLoraRequest {
    /// Human-readable name for the adapter.
    pub name: String,
    /// Globally unique integer ID (must be > 0).
    pub id: u32,
    /// Path to the adapter files.
    pub path: String,
    /// Base model the adapter was trained against, if known.
    pub base_model_name: Option<String>,
}

/// Tensor-backed adapter request.
#[derive(Debug, Clone)]
pub struct TensorLoraRequest {
    /// Human-readable name for the adapter.
    pub name: String,
    /// Globally unique integer ID (must be > 0).
    pub id: u32,
    /// PEFT configuration in `adapter_config.json` shape.
    pub peft_config: Map<String, Value>,
    /// LoRA weights keyed by PEFT parameter name.
    pub tensors: HashMap<String, Tensor>,
    /// New-vocabulary embeddings keyed `input_embeddings` / `output_embeddings`.
    pub embeddings: Option<HashMap<String, Tensor>>,
}

impl LoraRequest {
    /// Create a checkpoint-backed request.
    pub fn from_path(name: impl Into<String>, id: u32, path: impl Into<String>) -> Self {
        Self::Path(PathLoraRequest {
            name: name.into(),
            id,
            path: path.into(),
            base_model_name: None,
        })
    }

    /// Create a tensor-backed request.
    pub fn from_tensors(
        name: impl Into<String>,
        id: u32,
        peft_config: Map<String, Value>,
        tensors: HashMap<String, Tensor>,
    ) -> Self {
        Self::Tensors(TensorLoraRequest {
            name: name.into(),
            id,
            peft_config,
            tensors,
            embeddings: None,
        })
    }

    /// Build a request from loosely typed parts.
    ///
    /// Exactly one source must be present: a path, or a PEFT config together
    /// with tensors. Anything else is rejected rather than guessed at.
    pub fn from_parts(parts: LoraRequestParts) -> Result<Self, LoraLoadError> {
        let LoraRequestParts {
            name,
            id,
            path,
            peft_config,
            tensors,
            embeddings,
        } = parts;

        if id == 0 {
            return Err(malformed(&name, "adapter id must be greater than 0"));
        }

        match (path, peft_config, tensors) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => Err(malformed(
                &name,
                "both a checkpoint path and in-memory tensors were supplied",
            )),
            (Some(path), None, None) => {
                if embeddings.is_some() {
                    return Err(malformed(
                        &name,
                        "embeddings can only accompany in-memory tensors",
                    ));
                }
                Ok(Self::Path(PathLoraRequest {
                    name,
                    id,
                    path,
                    base_model_name: None,
                }))
            }
            (None, Some(peft_config), Some(tensors)) => Ok(Self::Tensors(TensorLoraRequest {
                name,
                id,
                peft_config,
                tensors,
                embeddings,
            })),
            (None, Some(_), None) => Err(malformed(&name, "peft_config supplied without tensors")),
            (None, None, Some(_)) => Err(malformed(&name, "tensors supplied without peft_config")),
            (None, None, None) => Err(malformed(
                &name,
                "neither a checkpoint path nor in-memory tensors were supplied",
            )),
        }
    }

    /// Adapter name.
    pub fn name(&self) -> &str {
        match self {
            Self::Path(req) => &req.name,
            Self::Tensors(req) => &req.name,
        }
    }

    /// Adapter ID.
    pub fn id(&self) -> u32 {
        match self {
            Self::Path(req) => req.id,
            Self::Tensors(req) => req.id,
        }
    }

    /// Short label of the request's source, for logs.
    pub fn source_kind(&self) -> &'static str {
        match self {
            Self::Path(_) => "path",
            Self::Tensors(_) => "tensors",
        }
    }
}

fn malformed(name: &str, reason: &str) -> LoraLoadError {
    LoraLoadError::MalformedRequest {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

/// Unvalidated request fields, e.g. as received over an RPC boundary.
#[derive(Debug, Clone, Default)]
pub struct LoraRequestParts {
    pub name: String,
    pub id: u32,
    pub path: Option<String>,
    pub peft_config: Option<Map<String, Value>>,
    pub tensors: Option<HashMap<String, Tensor>>,
    pub embeddings: Option<HashMap<String, Tensor>>,
}

/// LoRA weights for a single layer (low-rank matrices A and B).
///
/// The LoRA computation is:
/// ```text
/// output = base_output + scale * (x @ lora_a.T @ lora_b.T) + bias
/// ```
///
/// Where:
/// - lora_a: [rank, input_dim]
/// - lora_b: [output_dim, rank]
/// - scale: alpha / rank (or alpha / sqrt(rank) for rsLoRA)
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    /// Low-rank matrix A: [rank, input_dim].
    pub lora_a: Tensor,
    /// Low-rank matrix B: [output_dim, rank].
    pub lora_b: Tensor,
    /// Optional LoRA bias: [output_dim].
    pub bias: Option<Tensor>,
    /// New-vocabulary embedding rows for embedding modules: [extra_vocab, hidden].
    pub embeddings: Option<Tensor>,
    /// LoRA rank.
    pub rank: usize,
    /// Alpha parameter.
    pub alpha: f32,
    /// Scale applied to the low-rank product.
    pub scale: f32,
}

impl LoraAdapter {
    /// Create an adapter with a precomputed scale.
    pub fn with_scale(lora_a: Tensor, lora_b: Tensor, rank: usize, alpha: f32, scale: f32) -> Self {
        Self {
            lora_a,
            lora_b,
            bias: None,
            embeddings: None,
            rank,
            alpha,
            scale,
        }
    }

    /// Input dimension (from lora_a shape).
    pub fn input_dim(&self) -> usize {
        self.lora_a.dims().get(1).copied().unwrap_or(0)
    }

    /// Output dimension (from lora_b shape).
    pub fn output_dim(&self) -> usize {
        self.lora_b.dims().first().copied().unwrap_or(0)
    }

    /// Extra vocabulary rows contributed by this module.
    pub fn extra_vocab_size(&self) -> usize {
        self.embeddings
            .as_ref()
            .and_then(|e| e.dims().first().copied())
            .unwrap_or(0)
    }

    /// Pre-merge scaling into lora_b for faster inference.
    ///
    /// After calling this, scale becomes 1.0 and the scaling is baked into lora_b.
    pub fn optimize(&mut self) -> candle_core::Result<()> {
        if (self.scale - 1.0).abs() > f32::EPSILON {
            self.lora_b = (&self.lora_b * self.scale as f64)?;
            self.scale = 1.0;
        }
        Ok(())
    }
}

/// A complete LoRA model containing adapters for multiple layers.
#[derive(Debug)]
pub struct LoraModel {
    /// Adapter name.
    pub name: String,
    /// Unique ID.
    pub id: u32,
    /// LoRA rank.
    pub rank: usize,
    /// Alpha parameter.
    pub alpha: f32,
    /// Adapters by module name (e.g., "model.layers.0.self_attn.q_proj").
    pub adapters: HashMap<String, LoraAdapter>,
    /// Target modules this LoRA was trained for.
    pub target_modules: Vec<String>,
    /// Long-context scaling factor, when the adapter was trained for it.
    pub scaling_factor: Option<f32>,
    /// Checkpoint directory the adapter came from, if any.
    pub source_path: Option<PathBuf>,
}

impl LoraModel {
    /// Create a new empty LoRA model.
    pub fn new(name: impl Into<String>, id: u32, rank: usize, alpha: f32) -> Self {
        Self {
            name: name.into(),
            id,
            rank,
            alpha,
            adapters: HashMap::new(),
            target_modules: Vec::new(),
            scaling_factor: None,
            source_path: None,
        }
    }

    /// Get adapter for a specific module path.
    pub fn get_adapter(&self, module_name: &str) -> Option<&LoraAdapter> {
        self.adapters.get(module_name)
    }

    /// Add an adapter for a module.
    pub fn add_adapter(&mut self, module_name: impl Into<String>, adapter: LoraAdapter) {
        self.adapters.insert(module_name.into(), adapter);
    }

    /// Number of layers with adapters.
    pub fn num_adapters(&self) -> usize {
        self.adapters.len()
    }

    /// Largest extra vocabulary contributed by any module (0 without embeddings).
    pub fn extra_vocab_size(&self) -> usize {
        self.adapters
            .values()
            .map(LoraAdapter::extra_vocab_size)
            .max()
            .unwrap_or(0)
    }

    /// Optimize all adapters by pre-merging scale into lora_b.
    pub fn optimize(&mut self) -> candle_core::Result<()> {
        for adapter in self.adapters.values_mut() {
            adapter.optimize()?;
        }
        Ok(())
    }
}
