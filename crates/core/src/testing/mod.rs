//! Shared test utilities for tensor-lora-core.
//!
//! Builders for PEFT-shaped adapter tensors and configs, and a writer for
//! on-disk PEFT checkpoints.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use serde_json::{json, Map, Value};

/// A `lora_A` / `lora_B` pair for `module_path`, in PEFT naming.
///
/// `lora_A` is `[rank, in_dim]` and `lora_B` is `[out_dim, rank]`, both
/// filled with ones on CPU in F32.
pub fn lora_pair(
    module_path: &str,
    rank: usize,
    in_dim: usize,
    out_dim: usize,
) -> Vec<(String, Tensor)> {
    let ones = |shape: (usize, usize)| {
        Tensor::ones(shape, DType::F32, &Device::Cpu).expect("failed to allocate test tensor")
    };
    vec![
        (
            format!("base_model.model.{module_path}.lora_A.weight"),
            ones((rank, in_dim)),
        ),
        (
            format!("base_model.model.{module_path}.lora_B.weight"),
            ones((out_dim, rank)),
        ),
    ]
}

/// A minimal `adapter_config.json` body.
pub fn peft_config(rank: usize, alpha: f32, targets: &[&str]) -> Map<String, Value> {
    let value = json!({
        "r": rank,
        "lora_alpha": alpha,
        "target_modules": targets,
        "bias": "none",
        "peft_type": "LORA",
    });
    match value {
        Value::Object(map) => map,
        _ => unreachable!("json! object literal"),
    }
}

/// Write `adapter_config.json` and `adapter_model.safetensors` into `dir`.
pub fn write_peft_checkpoint(
    dir: &Path,
    config: &Map<String, Value>,
    tensors: &HashMap<String, Tensor>,
) -> anyhow::Result<()> {
    std::fs::write(
        dir.join("adapter_config.json"),
        serde_json::to_string_pretty(config)?,
    )?;
    candle_core::safetensors::save(tensors, dir.join("adapter_model.safetensors"))?;
    Ok(())
}

/// Write `new_embeddings.safetensors` into `dir`.
pub fn write_new_embeddings(
    dir: &Path,
    embeddings: &HashMap<String, Tensor>,
) -> anyhow::Result<()> {
    candle_core::safetensors::save(embeddings, dir.join("new_embeddings.safetensors"))?;
    Ok(())
}
