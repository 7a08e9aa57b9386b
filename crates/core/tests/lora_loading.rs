//! Integration tests for adapter loading through the public API.
//!
//! Checkpoints are written to temp directories with synthetic weights; no
//! network access or GPU is required.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use tensor_lora_core::lora::{
    LoraConfig, LoraLoadError, LoraManagerError, LoraRequest, LoraRequestParts,
    LruCacheWorkerLoraManager, ModelLoraLayout, WorkerLoraManager,
};
use tensor_lora_core::testing::{
    lora_pair, peft_config, write_new_embeddings, write_peft_checkpoint,
};
use tensor_lora_core::version::{is_version_ge, register_package, VersionError};

const VOCAB_SIZE: usize = 256;

fn llama_worker(config: LoraConfig) -> WorkerLoraManager {
    WorkerLoraManager::new(
        config,
        ModelLoraLayout::llama(),
        VOCAB_SIZE,
        Device::Cpu,
        DType::F32,
    )
}

fn attention_tensors(rank: usize) -> HashMap<String, Tensor> {
    let mut tensors = HashMap::new();
    for layer in 0..2 {
        for proj in ["q_proj", "k_proj", "v_proj", "o_proj"] {
            tensors.extend(lora_pair(
                &format!("model.layers.{layer}.self_attn.{proj}"),
                rank,
                64,
                64,
            ));
        }
    }
    tensors
}

// ─── Path-based loading ──────────────────────────────────────────────────────

#[test]
fn test_load_checkpoint_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let config = peft_config(8, 16.0, &["q_proj", "k_proj", "v_proj", "o_proj"]);
    write_peft_checkpoint(dir.path(), &config, &attention_tensors(8)).unwrap();

    let worker = llama_worker(LoraConfig::default());
    let request = LoraRequest::from_path("sql", 1, dir.path().to_string_lossy());
    let lora = worker.load_adapter(&request).unwrap();

    assert_eq!(lora.name, "sql");
    assert_eq!(lora.num_adapters(), 8);
    assert_eq!(lora.rank, 8);
    assert_eq!(lora.extra_vocab_size(), 0);

    let q_proj = lora.get_adapter("model.layers.1.self_attn.q_proj").unwrap();
    assert_eq!(q_proj.input_dim(), 64);
    assert_eq!(q_proj.output_dim(), 64);
}

#[test]
fn test_checkpoint_with_new_embeddings() {
    let dir = tempfile::tempdir().unwrap();
    let mut tensors = attention_tensors(8);
    tensors.extend(lora_pair("model.embed_tokens", 8, VOCAB_SIZE, 64));
    let config = peft_config(8, 16.0, &["q_proj", "k_proj", "v_proj", "o_proj", "embed_tokens"]);
    write_peft_checkpoint(dir.path(), &config, &tensors).unwrap();

    let mut embeddings = HashMap::new();
    embeddings.insert(
        "input_embeddings".to_string(),
        Tensor::zeros((32, 64), DType::F32, &Device::Cpu).unwrap(),
    );
    write_new_embeddings(dir.path(), &embeddings).unwrap();

    let worker = llama_worker(LoraConfig::default());
    let request = LoraRequest::from_path("vocab", 2, dir.path().to_string_lossy());
    let lora = worker.load_adapter(&request).unwrap();
    assert_eq!(lora.extra_vocab_size(), 32);
}

#[test]
fn test_checkpoint_extra_vocab_overflow() {
    let dir = tempfile::tempdir().unwrap();
    let tensors: HashMap<_, _> = lora_pair("model.embed_tokens", 8, VOCAB_SIZE, 64)
        .into_iter()
        .collect();
    write_peft_checkpoint(dir.path(), &peft_config(8, 16.0, &["embed_tokens"]), &tensors).unwrap();

    let mut embeddings = HashMap::new();
    embeddings.insert(
        "input_embeddings".to_string(),
        Tensor::zeros((64, 64), DType::F32, &Device::Cpu).unwrap(),
    );
    write_new_embeddings(dir.path(), &embeddings).unwrap();

    let config = LoraConfig {
        lora_extra_vocab_size: 32,
        ..Default::default()
    };
    let request = LoraRequest::from_path("vocab", 3, dir.path().to_string_lossy());
    let err = llama_worker(config).load_adapter(&request).unwrap_err();

    assert!(matches!(
        err,
        LoraLoadError::ExtraVocabOverflow {
            observed: 64,
            limit: 32
        }
    ));
    assert_eq!(
        err.to_string(),
        "LoRA added vocab size 64 is greater than lora_extra_vocab_size 32."
    );
}

#[test]
fn test_checkpoint_with_unexpected_modules() {
    let dir = tempfile::tempdir().unwrap();
    let mut tensors = attention_tensors(4);
    tensors.extend(lora_pair("model.layers.0.mlp.w_pack", 4, 64, 64));
    write_peft_checkpoint(dir.path(), &peft_config(4, 8.0, &["q_proj", "w_pack"]), &tensors)
        .unwrap();

    let request = LoraRequest::from_path("foreign", 1, dir.path().to_string_lossy());
    match llama_worker(LoraConfig::default()).load_adapter(&request).unwrap_err() {
        LoraLoadError::UnexpectedModules { unexpected, .. } => {
            assert_eq!(unexpected, vec!["model.layers.0.mlp.w_pack".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_checkpoint_rank_exceeds_limit() {
    let dir = tempfile::tempdir().unwrap();
    write_peft_checkpoint(
        dir.path(),
        &peft_config(32, 16.0, &["q_proj"]),
        &attention_tensors(32),
    )
    .unwrap();

    let request = LoraRequest::from_path("wide", 1, dir.path().to_string_lossy());
    let err = llama_worker(LoraConfig::default()).load_adapter(&request).unwrap_err();
    assert!(matches!(err, LoraLoadError::InvalidConfig(_)));
}

#[test]
fn test_missing_config_fields() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("adapter_config.json"), r#"{"r": 8}"#).unwrap();

    let request = LoraRequest::from_path("partial", 1, dir.path().to_string_lossy());
    match llama_worker(LoraConfig::default()).load_adapter(&request).unwrap_err() {
        LoraLoadError::MissingConfigFields(fields) => {
            assert_eq!(fields, vec!["lora_alpha".to_string(), "target_modules".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

// ─── Tensor-based loading ────────────────────────────────────────────────────

#[test]
fn test_tensor_and_path_loads_agree() {
    let dir = tempfile::tempdir().unwrap();
    let config = peft_config(8, 16.0, &["q_proj", "k_proj", "v_proj", "o_proj"]);
    let tensors = attention_tensors(8);
    write_peft_checkpoint(dir.path(), &config, &tensors).unwrap();

    let worker = llama_worker(LoraConfig::default());
    let from_disk = worker
        .load_adapter(&LoraRequest::from_path("a", 1, dir.path().to_string_lossy()))
        .unwrap();
    let from_memory = worker
        .load_adapter(&LoraRequest::from_tensors("a", 1, config, tensors))
        .unwrap();

    let mut disk_modules: Vec<_> = from_disk.adapters.keys().cloned().collect();
    let mut memory_modules: Vec<_> = from_memory.adapters.keys().cloned().collect();
    disk_modules.sort();
    memory_modules.sort();
    assert_eq!(disk_modules, memory_modules);

    let a = from_disk.get_adapter("model.layers.0.self_attn.v_proj").unwrap();
    let b = from_memory.get_adapter("model.layers.0.self_attn.v_proj").unwrap();
    let diff: f32 = (&a.lora_b - &b.lora_b)
        .unwrap()
        .abs()
        .unwrap()
        .sum_all()
        .unwrap()
        .to_scalar()
        .unwrap();
    assert_eq!(diff, 0.0);
}

#[test]
fn test_malformed_request_is_rejected() {
    let err = LoraRequest::from_parts(LoraRequestParts {
        name: "nothing".to_string(),
        id: 1,
        ..Default::default()
    })
    .unwrap_err();
    assert!(matches!(err, LoraLoadError::MalformedRequest { .. }));

    let err = LoraRequest::from_parts(LoraRequestParts {
        name: "both".to_string(),
        id: 1,
        path: Some("/tmp/adapter".to_string()),
        peft_config: Some(peft_config(8, 16.0, &["q_proj"])),
        tensors: Some(attention_tensors(8)),
        ..Default::default()
    })
    .unwrap_err();
    assert!(matches!(err, LoraLoadError::MalformedRequest { .. }));
}

// ─── Cache ───────────────────────────────────────────────────────────────────

#[test]
fn test_lru_cache_over_worker() {
    let config = LoraConfig {
        max_loras: 2,
        max_cpu_loras: Some(2),
        ..Default::default()
    };
    let mut manager = LruCacheWorkerLoraManager::new(llama_worker(config));

    let request = |id: u32| {
        LoraRequest::from_tensors(
            format!("adapter-{id}"),
            id,
            peft_config(8, 16.0, &["q_proj"]),
            lora_pair("model.layers.0.self_attn.q_proj", 8, 64, 64)
                .into_iter()
                .collect(),
        )
    };

    manager.set_active_adapters(&[request(1), request(2)]).unwrap();
    assert_eq!(manager.list_adapters(), vec![1, 2]);

    // 1 becomes most recently used, so 2 is evicted
    assert!(!manager.add_adapter(&request(1)).unwrap());
    assert!(manager.add_adapter(&request(3)).unwrap());
    assert_eq!(manager.list_adapters(), vec![1, 3]);

    let err = manager
        .set_active_adapters(&[request(4), request(5), request(6)])
        .unwrap_err();
    assert!(matches!(err, LoraManagerError::TooManyActiveAdapters { .. }));
}

// ─── Version gate ────────────────────────────────────────────────────────────

#[test]
fn test_version_gate() {
    register_package("inference-backend", "0.7.3");
    assert!(is_version_ge("inference-backend", "0.7.3").unwrap());
    assert!(is_version_ge("inference_backend", "0.7.0").unwrap());
    assert!(!is_version_ge("inference-backend", "0.8.0rc1").unwrap());
    assert_eq!(
        is_version_ge("not-installed", "1.0"),
        Err(VersionError::PackageNotFound("not-installed".to_string()))
    );
}
