//! Per-worker LoRA adapter loading.

use std::collections::BTreeSet;

use candle_core::{DType, Device};

use super::config::LoraConfig;
use super::layout::ModelLoraLayout;
use super::loader::{LoadOptions, LoraLoadError, LoraLoader, LoraModelFactory};
use super::path::resolve_adapter_path;
use super::peft::PeftConfig;
use super::types::{LoraModel, LoraRequest};

/// Turns [`LoraRequest`]s into validated [`LoraModel`]s for one model replica.
///
/// Both request variants go through the same pipeline: resolve the PEFT
/// config, validate it against the engine's [`LoraConfig`], materialize
/// through the configured [`LoraModelFactory`], then check the added
/// vocabulary fits. Nothing is cached here; see
/// [`LruCacheWorkerLoraManager`](super::LruCacheWorkerLoraManager).
pub struct WorkerLoraManager {
    lora_config: LoraConfig,
    vocab_size: usize,
    max_position_embeddings: Option<usize>,
    layout: ModelLoraLayout,
    expected_modules: BTreeSet<String>,
    factory: Box<dyn LoraModelFactory>,
}

impl WorkerLoraManager {
    /// Create a worker using the default [`LoraLoader`].
    ///
    /// LoRA weights are placed on `device` in `lora_config.lora_dtype`,
    /// falling back to `model_dtype` for `auto`.
    pub fn new(
        lora_config: LoraConfig,
        layout: ModelLoraLayout,
        vocab_size: usize,
        device: Device,
        model_dtype: DType,
    ) -> Self {
        let dtype = lora_config.lora_dtype.resolve(model_dtype);
        let loader = LoraLoader::new(device, dtype);
        Self::with_model_factory(lora_config, layout, vocab_size, Box::new(loader))
    }

    /// Create a worker with a custom adapter factory.
    pub fn with_model_factory(
        lora_config: LoraConfig,
        layout: ModelLoraLayout,
        vocab_size: usize,
        factory: Box<dyn LoraModelFactory>,
    ) -> Self {
        let expected_modules = layout.expected_lora_modules();
        Self {
            lora_config,
            vocab_size,
            max_position_embeddings: None,
            layout,
            expected_modules,
            factory,
        }
    }

    /// Base model context length, used for long-context adapters.
    pub fn with_max_position_embeddings(mut self, max_position_embeddings: usize) -> Self {
        self.max_position_embeddings = Some(max_position_embeddings);
        self
    }

    pub fn lora_config(&self) -> &LoraConfig {
        &self.lora_config
    }

    pub fn layout(&self) -> &ModelLoraLayout {
        &self.layout
    }

    /// Checkpoint module names adapters may target.
    pub fn expected_lora_modules(&self) -> &BTreeSet<String> {
        &self.expected_modules
    }

    /// Load an adapter from a checkpoint or from in-memory tensors.
    pub fn load_adapter(&self, request: &LoraRequest) -> Result<LoraModel, LoraLoadError> {
        tracing::info!(
            lora_id = request.id(),
            lora_name = request.name(),
            source = request.source_kind(),
            "Loading LoRA adapter"
        );

        let options = LoadOptions {
            target_embedding_padding: Some(self.vocab_size + self.lora_config.lora_extra_vocab_size),
            embedding_modules: &self.layout.embedding_modules,
            embedding_padding_modules: &self.layout.embedding_padding_modules,
            weights_mapper: self.layout.weights_mapper(),
        };

        let lora = match request {
            LoraRequest::Tensors(req) => {
                let peft = PeftConfig::from_dict(&req.peft_config)?;
                peft.validate_legal(&self.lora_config)?;
                self.factory.from_lora_tensors(
                    req.id,
                    &req.name,
                    req.tensors.clone(),
                    &peft,
                    req.embeddings.clone(),
                    &options,
                )?
            }
            LoraRequest::Path(req) => {
                let lora_path = resolve_adapter_path(&req.path);
                let peft = PeftConfig::from_local_dir(&lora_path, self.max_position_embeddings)?;
                peft.validate_legal(&self.lora_config)?;
                self.factory.from_local_checkpoint(
                    &lora_path,
                    &self.expected_modules,
                    req.id,
                    &req.name,
                    &peft,
                    &options,
                )?
            }
        };

        let limit = self.lora_config.lora_extra_vocab_size;
        let observed = lora.extra_vocab_size();
        if observed > limit {
            return Err(LoraLoadError::ExtraVocabOverflow { observed, limit });
        }

        tracing::debug!(
            lora_id = lora.id,
            modules = lora.num_adapters(),
            rank = lora.rank,
            "LoRA adapter loaded"
        );
        Ok(lora)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use candle_core::Tensor;

    use super::*;
    use crate::testing::{lora_pair, peft_config, write_peft_checkpoint};

    fn worker() -> WorkerLoraManager {
        WorkerLoraManager::new(
            LoraConfig::default(),
            ModelLoraLayout::llama(),
            128,
            Device::Cpu,
            DType::F32,
        )
    }

    #[test]
    fn test_tensor_request() {
        let tensors: HashMap<_, _> = lora_pair("model.layers.0.self_attn.q_proj", 8, 32, 32)
            .into_iter()
            .collect();
        let request = LoraRequest::from_tensors("actor", 1, peft_config(8, 16.0, &["q_proj"]), tensors);

        let lora = worker().load_adapter(&request).unwrap();
        assert_eq!(lora.name, "actor");
        assert_eq!(lora.rank, 8);
        assert_eq!(lora.extra_vocab_size(), 0);
        assert!(lora.source_path.is_none());
    }

    #[test]
    fn test_tensor_request_rank_over_limit() {
        let tensors: HashMap<_, _> = lora_pair("model.layers.0.self_attn.q_proj", 32, 32, 32)
            .into_iter()
            .collect();
        let request = LoraRequest::from_tensors("big", 1, peft_config(32, 16.0, &["q_proj"]), tensors);

        let err = worker().load_adapter(&request).unwrap_err();
        assert!(matches!(err, LoraLoadError::InvalidConfig(_)));
        assert!(err.to_string().contains("max_lora_rank 16"));
    }

    #[test]
    fn test_extra_vocab_overflow() {
        let tensors: HashMap<_, _> = lora_pair("model.embed_tokens", 8, 128, 64)
            .into_iter()
            .collect();
        let mut embeddings = HashMap::new();
        embeddings.insert(
            "input_embeddings".to_string(),
            Tensor::zeros((300, 64), DType::F32, &Device::Cpu).unwrap(),
        );
        let request = LoraRequest::Tensors(crate::lora::TensorLoraRequest {
            name: "vocab".to_string(),
            id: 2,
            peft_config: peft_config(8, 16.0, &["embed_tokens"]),
            tensors,
            embeddings: Some(embeddings),
        });

        match worker().load_adapter(&request).unwrap_err() {
            LoraLoadError::ExtraVocabOverflow { observed, limit } => {
                assert_eq!(observed, 300);
                assert_eq!(limit, 256);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_path_request() {
        let dir = tempfile::tempdir().unwrap();
        let tensors: HashMap<_, _> = lora_pair("model.layers.0.mlp.gate_proj", 8, 32, 64)
            .into_iter()
            .collect();
        write_peft_checkpoint(dir.path(), &peft_config(8, 16.0, &["gate_proj"]), &tensors).unwrap();

        let request = LoraRequest::from_path("disk", 4, dir.path().to_string_lossy());
        let lora = worker().load_adapter(&request).unwrap();
        assert_eq!(lora.id, 4);
        assert!(lora.get_adapter("model.layers.0.mlp.gate_proj").is_some());
        assert_eq!(lora.source_path.as_deref(), Some(dir.path()));
    }

    #[test]
    fn test_path_request_missing_config() {
        let dir = tempfile::tempdir().unwrap();
        let request = LoraRequest::from_path("empty", 1, dir.path().to_string_lossy());
        let err = worker().load_adapter(&request).unwrap_err();
        assert!(matches!(err, LoraLoadError::ConfigNotFound(_)));
    }

    #[test]
    fn test_zero_rank_rejected_before_materialization() {
        let tensors: HashMap<_, _> = lora_pair("model.layers.0.self_attn.q_proj", 4, 32, 32)
            .into_iter()
            .collect();
        let request = LoraRequest::from_tensors("empty", 1, peft_config(0, 16.0, &["q_proj"]), tensors);

        let err = worker().load_adapter(&request).unwrap_err();
        assert!(matches!(err, LoraLoadError::InvalidConfig(_)));
    }

    #[test]
    fn test_qwen2_vl_checkpoint_names_are_mapped() {
        let worker = WorkerLoraManager::new(
            LoraConfig::default(),
            ModelLoraLayout::qwen2_vl(),
            128,
            Device::Cpu,
            DType::F32,
        );

        let dir = tempfile::tempdir().unwrap();
        let mut tensors = HashMap::new();
        tensors.extend(lora_pair("model.layers.0.self_attn.q_proj", 8, 32, 32));
        tensors.extend(lora_pair("model.layers.0.mlp.down_proj", 8, 64, 32));
        write_peft_checkpoint(dir.path(), &peft_config(8, 16.0, &["q_proj", "down_proj"]), &tensors)
            .unwrap();

        let request = LoraRequest::from_path("vl", 1, dir.path().to_string_lossy());
        let lora = worker.load_adapter(&request).unwrap();
        let mut modules: Vec<_> = lora.adapters.keys().cloned().collect();
        modules.sort();
        assert_eq!(
            modules,
            vec![
                "language_model.model.layers.0.mlp.down_proj".to_string(),
                "language_model.model.layers.0.self_attn.q_proj".to_string(),
            ]
        );

        let dir = tempfile::tempdir().unwrap();
        let mut tensors = HashMap::new();
        tensors.extend(lora_pair("model.layers.0.self_attn.q_proj", 8, 32, 32));
        tensors.extend(lora_pair("model.visual.blocks.0.attn.qkv", 8, 32, 96));
        write_peft_checkpoint(dir.path(), &peft_config(8, 16.0, &["q_proj", "qkv"]), &tensors)
            .unwrap();

        let request = LoraRequest::from_path("vl-vision", 2, dir.path().to_string_lossy());
        match worker.load_adapter(&request).unwrap_err() {
            LoraLoadError::UnexpectedModules { unexpected, .. } => {
                assert_eq!(unexpected, vec!["visual.blocks.0.attn.qkv".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    struct CountingFactory {
        inner: LoraLoader,
        tensor_loads: Arc<AtomicUsize>,
    }

    impl LoraModelFactory for CountingFactory {
        fn from_lora_tensors(
            &self,
            id: u32,
            name: &str,
            tensors: HashMap<String, Tensor>,
            peft: &PeftConfig,
            embeddings: Option<HashMap<String, Tensor>>,
            options: &LoadOptions<'_>,
        ) -> Result<LoraModel, LoraLoadError> {
            self.tensor_loads.fetch_add(1, Ordering::SeqCst);
            self.inner
                .from_lora_tensors(id, name, tensors, peft, embeddings, options)
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
            self.inner
                .from_local_checkpoint(dir, expected_modules, id, name, peft, options)
        }
    }

    #[test]
    fn test_custom_factory_is_used() {
        let tensor_loads = Arc::new(AtomicUsize::new(0));
        let factory = CountingFactory {
            inner: LoraLoader::new(Device::Cpu, DType::F32),
            tensor_loads: Arc::clone(&tensor_loads),
        };
        let worker = WorkerLoraManager::with_model_factory(
            LoraConfig::default(),
            ModelLoraLayout::llama(),
            128,
            Box::new(factory),
        );

        let tensors: HashMap<_, _> = lora_pair("model.layers.0.self_attn.o_proj", 8, 32, 32)
            .into_iter()
            .collect();
        let request = LoraRequest::from_tensors("actor", 1, peft_config(8, 16.0, &["o_proj"]), tensors);
        worker.load_adapter(&request).unwrap();

        assert_eq!(tensor_loads.load(Ordering::SeqCst), 1);
    }
}
