//! Per-architecture description of where LoRA can attach.

use std::collections::{BTreeMap, BTreeSet};

use super::mapper::WeightsMapper;

/// LoRA-relevant layout of a base model.
///
/// Engine modules may fuse several checkpoint modules into one loading unit
/// (`qkv_proj` packs `q_proj`, `k_proj` and `v_proj`); adapters are trained
/// against the unpacked names.
#[derive(Debug, Clone, Default)]
pub struct ModelLoraLayout {
    /// Engine modules that accept LoRA.
    pub supported_lora_modules: Vec<String>,
    /// Packed engine module -> checkpoint sub-modules.
    pub packed_modules_mapping: BTreeMap<String, Vec<String>>,
    /// Embedding module -> key in `new_embeddings.safetensors`.
    pub embedding_modules: BTreeMap<String, String>,
    /// Modules whose LoRA B output is padded to the extended vocabulary.
    pub embedding_padding_modules: Vec<String>,
    /// Checkpoint-name translation, for families that need it.
    pub weights_mapper: Option<WeightsMapper>,
}

fn owned(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

impl ModelLoraLayout {
    /// Llama-style decoders: fused QKV and gate/up projections, LoRA on
    /// embeddings and LM head.
    pub fn llama() -> Self {
        let mut packed = BTreeMap::new();
        packed.insert("qkv_proj".to_string(), owned(&["q_proj", "k_proj", "v_proj"]));
        packed.insert("gate_up_proj".to_string(), owned(&["gate_proj", "up_proj"]));

        let mut embedding_modules = BTreeMap::new();
        embedding_modules.insert("embed_tokens".to_string(), "input_embeddings".to_string());
        embedding_modules.insert("lm_head".to_string(), "output_embeddings".to_string());

        Self {
            supported_lora_modules: owned(&[
                "qkv_proj",
                "o_proj",
                "gate_up_proj",
                "down_proj",
                "embed_tokens",
                "lm_head",
            ]),
            packed_modules_mapping: packed,
            embedding_modules,
            embedding_padding_modules: owned(&["lm_head"]),
            weights_mapper: None,
        }
    }

    /// Gemma: same projections, no embedding LoRA.
    pub fn gemma() -> Self {
        Self {
            supported_lora_modules: owned(&["qkv_proj", "o_proj", "gate_up_proj", "down_proj"]),
            embedding_modules: BTreeMap::new(),
            embedding_padding_modules: Vec::new(),
            ..Self::llama()
        }
    }

    /// Phi-3 checkpoints already store fused `qkv_proj` / `gate_up_proj`.
    pub fn phi3() -> Self {
        let mut packed = BTreeMap::new();
        packed.insert("qkv_proj".to_string(), owned(&["qkv_proj"]));
        packed.insert("gate_up_proj".to_string(), owned(&["gate_up_proj"]));
        Self {
            packed_modules_mapping: packed,
            ..Self::llama()
        }
    }

    /// Qwen2-VL: language model nested under `language_model.`.
    pub fn qwen2_vl() -> Self {
        let mapper = WeightsMapper::new()
            .with_prefix("model.language_model.", Some("language_model.model."))
            .with_prefix("model.visual.", Some("visual."))
            .with_prefix("lm_head.", Some("language_model.lm_head."))
            .with_prefix("model.", Some("language_model.model."));
        Self {
            supported_lora_modules: owned(&["qkv_proj", "o_proj", "gate_up_proj", "down_proj"]),
            embedding_modules: BTreeMap::new(),
            embedding_padding_modules: Vec::new(),
            weights_mapper: Some(mapper),
            ..Self::llama()
        }
    }

    /// Look up the layout for a HuggingFace `architectures` entry.
    pub fn for_architecture(arch: &str) -> Option<Self> {
        match arch {
            "LlamaForCausalLM" | "MistralForCausalLM" | "Qwen2ForCausalLM"
            | "Qwen3ForCausalLM" | "Olmo2ForCausalLM" | "MixtralForCausalLM" => {
                Some(Self::llama())
            }
            "GemmaForCausalLM" | "Gemma2ForCausalLM" => Some(Self::gemma()),
            "Phi3ForCausalLM" => Some(Self::phi3()),
            "Qwen2VLForConditionalGeneration" | "Qwen2_5_VLForConditionalGeneration" => {
                Some(Self::qwen2_vl())
            }
            _ => None,
        }
    }

    /// Checkpoint module names an adapter may target: supported modules
    /// with packed groups expanded, deduplicated.
    pub fn expected_lora_modules(&self) -> BTreeSet<String> {
        let mut expected = BTreeSet::new();
        for module in &self.supported_lora_modules {
            match self.packed_modules_mapping.get(module) {
                Some(sub_modules) => expected.extend(sub_modules.iter().cloned()),
                None => {
                    expected.insert(module.clone());
                }
            }
        }
        expected
    }

    pub fn weights_mapper(&self) -> Option<&WeightsMapper> {
        self.weights_mapper.as_ref()
    }
}
