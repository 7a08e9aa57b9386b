//! LoRA adapter materialization from PEFT checkpoints or in-memory tensors.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use regex::Regex;
use thiserror::Error;

use super::mapper::WeightsMapper;
use super::peft::{PeftConfig, TargetModules};
use super::types::{LoraAdapter, LoraModel};

const PEFT_PREFIX: &str = "base_model.model.";

/// Errors that can occur during LoRA loading.
#[derive(Debug, Error)]
pub enum LoraLoadError {
    #[error("adapter config not found at {0}")]
    ConfigNotFound(String),
    #[error("failed to parse adapter config: {0}")]
    ConfigParse(String),
    #[error("missing required configuration fields: {0:?}")]
    MissingConfigFields(Vec<String>),
    #[error("{0}")]
    InvalidConfig(String),
    #[error("{0} doesn't contain tensors")]
    WeightsNotFound(String),
    #[error("failed to load weights: {0}")]
    WeightsLoad(String),
    #[error("{0} is unsupported LoRA weight")]
    UnsupportedWeight(String),
    #[error(
        "While loading {path}, expected target modules in {expected:?} but received \
         {unexpected:?}. Please verify that the loaded LoRA module is correct"
    )]
    UnexpectedModules {
        path: String,
        expected: Vec<String>,
        unexpected: Vec<String>,
    },
    #[error("mismatched lora_a and lora_b shapes for {module}: a={a_shape:?}, b={b_shape:?}")]
    ShapeMismatch {
        module: String,
        a_shape: Vec<usize>,
        b_shape: Vec<usize>,
    },
    #[error("missing lora_a or lora_b for module {0}")]
    IncompleteAdapter(String),
    #[error("cannot pad {module} output dim {output_dim} down to {target}")]
    EmbeddingPadding {
        module: String,
        output_dim: usize,
        target: usize,
    },
    #[error("LoRA added vocab size {observed} is greater than lora_extra_vocab_size {limit}.")]
    ExtraVocabOverflow { observed: usize, limit: usize },
    #[error("malformed LoRA request '{name}': {reason}")]
    MalformedRequest { name: String, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// Which part of a LoRA layer a checkpoint tensor holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoraWeightKind {
    A,
    B,
    Bias,
}

/// Parse a PEFT weight name into its module path and weight kind.
///
/// The `base_model.model.` wrapper is removed before `mapper` runs and is
/// not part of the returned module path. Examples:
/// - `base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight`
///   -> ("model.layers.0.self_attn.q_proj", A)
/// - `base_model.model.model.embed_tokens.lora_embedding_B`
///   -> ("model.embed_tokens", B)
/// - `base_model.model.model.layers.0.mlp.down_proj.lora_B.bias`
///   -> ("model.layers.0.mlp.down_proj", Bias)
pub fn parse_lora_weight_name(
    name: &str,
    mapper: Option<&WeightsMapper>,
) -> Result<(String, LoraWeightKind), LoraLoadError> {
    let unsupported = || LoraLoadError::UnsupportedWeight(name.to_string());
    let map = |n: &str| match mapper {
        Some(mapper) => mapper.map_name(n).ok_or_else(unsupported),
        None => Ok(n.to_string()),
    };

    let mapped = if name.contains(PEFT_PREFIX) {
        format!("{}{}", PEFT_PREFIX, map(&name.replace(PEFT_PREFIX, ""))?)
    } else {
        map(name)?
    };
    // Checkpoints without the PEFT wrapper keep their leading segments.
    let start = if mapped.contains(PEFT_PREFIX) { 2 } else { 0 };

    let parts: Vec<&str> = mapped.split('.').collect();
    let n = parts.len();
    let module = |end: usize| -> Result<String, LoraLoadError> {
        match parts.get(start..end) {
            Some(segments) if !segments.is_empty() => Ok(segments.join(".")),
            _ => Err(unsupported()),
        }
    };

    match parts.as_slice() {
        [.., "lora_A", "weight"] => Ok((module(n - 2)?, LoraWeightKind::A)),
        [.., "lora_B", "weight"] => Ok((module(n - 2)?, LoraWeightKind::B)),
        [.., "lora_embedding_A"] => Ok((module(n - 1)?, LoraWeightKind::A)),
        [.., "lora_embedding_B"] => Ok((module(n - 1)?, LoraWeightKind::B)),
        [.., _, "bias"] => Ok((module(n - 2)?, LoraWeightKind::Bias)),
        _ => Err(unsupported()),
    }
}

/// Whether a regex `target_modules` only selects expected modules.
///
/// Only the trailing alternation group is inspected, e.g.
/// `.*\.(q_proj|v_proj)$` -> {q_proj, v_proj}.
pub fn is_regex_target_modules(
    target_modules: &TargetModules,
    expected_lora_modules: &BTreeSet<String>,
) -> bool {
    let TargetModules::Pattern(pattern) = target_modules else {
        return false;
    };
    if Regex::new(pattern).is_err() {
        return false;
    }
    let Ok(group) = Regex::new(r"\((.*?)\)\$?$") else {
        return false;
    };
    match group.captures(pattern).and_then(|c| c.get(1)) {
        Some(alternatives) => alternatives
            .as_str()
            .split('|')
            .all(|suffix| expected_lora_modules.contains(suffix)),
        None => false,
    }
}

/// Model-dependent settings used while materializing an adapter.
#[derive(Debug, Clone, Copy)]
pub struct LoadOptions<'a> {
    /// Output rows LoRA B of padding modules is padded to
    /// (`vocab_size + lora_extra_vocab_size`).
    pub target_embedding_padding: Option<usize>,
    /// Embedding module -> key in the new-embeddings tensors.
    pub embedding_modules: &'a BTreeMap<String, String>,
    /// Modules whose LoRA B is padded.
    pub embedding_padding_modules: &'a [String],
    /// Checkpoint-name translation.
    pub weights_mapper: Option<&'a WeightsMapper>,
}

/// Builds [`LoraModel`]s for the worker.
///
/// This is the injection point for alternative materialization strategies;
/// [`LoraLoader`] is the default.
pub trait LoraModelFactory: Send + Sync {
    /// Build an adapter from in-memory tensors keyed by PEFT weight name.
    fn from_lora_tensors(
        &self,
        id: u32,
        name: &str,
        tensors: HashMap<String, Tensor>,
        peft: &PeftConfig,
        embeddings: Option<HashMap<String, Tensor>>,
        options: &LoadOptions<'_>,
    ) -> Result<LoraModel, LoraLoadError>;

    /// Build an adapter from a PEFT checkpoint directory, rejecting weights
    /// for modules outside `expected_modules`.
    fn from_local_checkpoint(
        &self,
        dir: &Path,
        expected_modules: &BTreeSet<String>,
        id: u32,
        name: &str,
        peft: &PeftConfig,
        options: &LoadOptions<'_>,
    ) -> Result<LoraModel, LoraLoadError>;
}

#[derive(Default)]
struct PartialAdapter {
    lora_a: Option<Tensor>,
    lora_b: Option<Tensor>,
    bias: Option<Tensor>,
}

/// LoRA adapter loader for HuggingFace PEFT format.
///
/// Loads adapters from directories containing:
/// - `adapter_config.json`: PEFT configuration
/// - `adapter_model.safetensors`, `adapter_model.bin` or `adapter_model.pt`: weights
/// - optionally `new_embeddings.safetensors` or `new_embeddings.bin`
///
/// or directly from tensors already in memory.
pub struct LoraLoader {
    device: Device,
    dtype: DType,
}

impl LoraLoader {
    /// Create a new loader for the specified device and dtype.
    pub fn new(device: Device, dtype: DType) -> Self {
        Self { device, dtype }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Move a tensor to the loader's device and dtype.
    fn place(&self, tensor: Tensor) -> Result<Tensor, LoraLoadError> {
        let tensor = tensor.to_device(&self.device)?;
        if tensor.dtype() != self.dtype {
            Ok(tensor.to_dtype(self.dtype)?)
        } else {
            Ok(tensor)
        }
    }

    /// Load weights from safetensors file.
    fn load_safetensors(&self, path: &Path) -> Result<HashMap<String, Tensor>, LoraLoadError> {
        candle_core::safetensors::load(path, &self.device)
            .map_err(|e| LoraLoadError::WeightsLoad(format!("{}: {e}", path.display())))
    }

    /// Load weights from pickle (.bin / .pt) file.
    fn load_pickle(&self, path: &Path) -> Result<HashMap<String, Tensor>, LoraLoadError> {
        let tensors = candle_core::pickle::read_all(path)
            .map_err(|e| LoraLoadError::WeightsLoad(format!("{}: {e}", path.display())))?;
        Ok(tensors.into_iter().collect())
    }

    /// Group tensors by module, pairing lora_A / lora_B / bias.
    fn group_weights_by_module(
        &self,
        tensors: HashMap<String, Tensor>,
        mapper: Option<&WeightsMapper>,
    ) -> Result<BTreeMap<String, PartialAdapter>, LoraLoadError> {
        let mut grouped: BTreeMap<String, PartialAdapter> = BTreeMap::new();
        for (tensor_name, tensor) in tensors {
            let (module_name, kind) = parse_lora_weight_name(&tensor_name, mapper)?;
            let tensor = self.place(tensor)?;
            let entry = grouped.entry(module_name).or_default();
            match kind {
                LoraWeightKind::A => entry.lora_a = Some(tensor),
                LoraWeightKind::B => entry.lora_b = Some(tensor),
                LoraWeightKind::Bias => entry.bias = Some(tensor),
            }
        }
        Ok(grouped)
    }

    fn embeddings_for(
        &self,
        module_name: &str,
        embeddings: Option<&HashMap<String, Tensor>>,
        options: &LoadOptions<'_>,
    ) -> Result<Option<Tensor>, LoraLoadError> {
        let Some(embeddings) = embeddings else {
            return Ok(None);
        };
        let Some(key) = options
            .embedding_modules
            .iter()
            .find(|(module, _)| module_name.contains(module.as_str()))
            .map(|(_, key)| key)
        else {
            return Ok(None);
        };
        let tensor = embeddings.get(key).ok_or_else(|| {
            LoraLoadError::WeightsLoad(format!(
                "new embeddings have no '{key}' tensor for module {module_name}"
            ))
        })?;
        if tensor.rank() != 2 {
            return Err(LoraLoadError::WeightsLoad(format!(
                "new embeddings '{key}' for module {module_name} must be 2-D, got shape {:?}",
                tensor.dims()
            )));
        }
        Ok(Some(self.place(tensor.clone())?))
    }

    /// Find checkpoint tensors for modules the model cannot host.
    fn check_unexpected_modules<'k>(
        &self,
        names: impl Iterator<Item = &'k String>,
        expected: &BTreeSet<String>,
        mapper: Option<&WeightsMapper>,
        dir: &Path,
    ) -> Result<(), LoraLoadError> {
        let mut unexpected = Vec::new();
        for name in names {
            let (module_name, _) = parse_lora_weight_name(name, mapper)?;
            let part_name = module_name.rsplit('.').next().unwrap_or(&module_name);
            if !expected.contains(part_name) {
                unexpected.push(module_name);
            }
        }
        if unexpected.is_empty() {
            return Ok(());
        }
        unexpected.sort();
        unexpected.dedup();
        Err(unexpected_modules(dir, expected, unexpected))
    }

    /// Pickled checkpoints are not inspected; the config's target modules
    /// stand in for the weight names.
    fn check_target_modules(
        &self,
        peft: &PeftConfig,
        expected: &BTreeSet<String>,
        dir: &Path,
    ) -> Result<(), LoraLoadError> {
        let unexpected: Vec<String> = peft
            .target_modules
            .names()
            .into_iter()
            .filter(|module| {
                let part_name = module.rsplit('.').next().unwrap_or(module);
                !expected.contains(part_name)
            })
            .collect();
        if unexpected.is_empty() || is_regex_target_modules(&peft.target_modules, expected) {
            return Ok(());
        }
        Err(unexpected_modules(dir, expected, unexpected))
    }
}

fn unexpected_modules(
    dir: &Path,
    expected: &BTreeSet<String>,
    unexpected: Vec<String>,
) -> LoraLoadError {
    LoraLoadError::UnexpectedModules {
        path: dir.display().to_string(),
        expected: expected.iter().cloned().collect(),
        unexpected,
    }
}

impl LoraModelFactory for LoraLoader {
    fn from_lora_tensors(
        &self,
        id: u32,
        name: &str,
        tensors: HashMap<String, Tensor>,
        peft: &PeftConfig,
        embeddings: Option<HashMap<String, Tensor>>,
        options: &LoadOptions<'_>,
    ) -> Result<LoraModel, LoraLoadError> {
        let mut model = LoraModel::new(name, id, peft.r, peft.lora_alpha);
        model.target_modules = peft.target_modules.names();
        model.scaling_factor = peft.long_context_scaling_factor();
        let scale = peft.scaling();

        let module_weights = self.group_weights_by_module(tensors, options.weights_mapper)?;

        for (module_name, weights) in module_weights {
            let (Some(lora_a), Some(lora_b)) = (weights.lora_a, weights.lora_b) else {
                return Err(LoraLoadError::IncompleteAdapter(module_name));
            };

            // HF PEFT uses: lora_A: [rank, in], lora_B: [out, rank]
            let a_dims = lora_a.dims();
            let b_dims = lora_b.dims();
            if a_dims.len() != 2
                || b_dims.len() != 2
                || a_dims[0] != b_dims[1]
                || a_dims[0] != peft.r
            {
                return Err(LoraLoadError::ShapeMismatch {
                    module: module_name,
                    a_shape: a_dims.to_vec(),
                    b_shape: b_dims.to_vec(),
                });
            }

            let pads_output = options
                .embedding_padding_modules
                .iter()
                .any(|m| module_name.contains(m.as_str()));
            let lora_b = match options.target_embedding_padding {
                Some(target) if pads_output => {
                    let output_dim = b_dims[0];
                    if output_dim > target {
                        return Err(LoraLoadError::EmbeddingPadding {
                            module: module_name,
                            output_dim,
                            target,
                        });
                    }
                    lora_b.pad_with_zeros(0, 0, target - output_dim)?
                }
                _ => lora_b,
            };

            let mut adapter = LoraAdapter::with_scale(lora_a, lora_b, peft.r, peft.lora_alpha, scale);
            adapter.bias = weights.bias;
            adapter.embeddings = self.embeddings_for(&module_name, embeddings.as_ref(), options)?;
            model.add_adapter(module_name, adapter);
        }

        model.optimize()?;
        tracing::debug!(
            lora_id = id,
            modules = model.num_adapters(),
            extra_vocab_size = model.extra_vocab_size(),
            "Materialized LoRA adapter"
        );
        Ok(model)
    }

    fn from_local_checkpoint(
        &self,
        dir: &Path,
        expected_modules: &BTreeSet<String>,
        id: u32,
        name: &str,
        peft: &PeftConfig,
        options: &LoadOptions<'_>,
    ) -> Result<LoraModel, LoraLoadError> {
        let safetensors_path = dir.join("adapter_model.safetensors");
        let bin_path = dir.join("adapter_model.bin");
        let pt_path = dir.join("adapter_model.pt");

        let tensors = if safetensors_path.is_file() {
            let tensors = self.load_safetensors(&safetensors_path)?;
            self.check_unexpected_modules(
                tensors.keys(),
                expected_modules,
                options.weights_mapper,
                dir,
            )?;
            tensors
        } else if bin_path.is_file() || pt_path.is_file() {
            self.check_target_modules(peft, expected_modules, dir)?;
            let path = if bin_path.is_file() { &bin_path } else { &pt_path };
            self.load_pickle(path)?
        } else {
            return Err(LoraLoadError::WeightsNotFound(dir.display().to_string()));
        };

        let new_embeddings_safetensors = dir.join("new_embeddings.safetensors");
        let new_embeddings_bin = dir.join("new_embeddings.bin");
        let embeddings = if new_embeddings_safetensors.is_file() {
            Some(self.load_safetensors(&new_embeddings_safetensors)?)
        } else if new_embeddings_bin.is_file() {
            Some(self.load_pickle(&new_embeddings_bin)?)
        } else {
            None
        };

        let mut model = self.from_lora_tensors(id, name, tensors, peft, embeddings, options)?;
        model.source_path = Some(dir.to_path_buf());
        Ok(model)
    }
}
