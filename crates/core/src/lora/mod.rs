//! LoRA (Low-Rank Adaptation) support for efficient fine-tuning.
//!
//! This module loads LoRA adapters either from PEFT checkpoints on disk or
//! from tensors already in memory, validates them against the engine's
//! adapter capacity, and caches them for per-request selection.

mod config;
mod layout;
mod loader;
mod manager;
mod mapper;
mod path;
mod peft;
mod types;
mod worker;

pub use config::{LoraConfig, LoraConfigError, LoraDtype, SUPPORTED_MAX_LORA_RANKS};
pub use layout::ModelLoraLayout;
pub use loader::{
    is_regex_target_modules, parse_lora_weight_name, LoadOptions, LoraLoadError, LoraLoader,
    LoraModelFactory, LoraWeightKind,
};
pub use manager::{LoraManagerError, LruCacheWorkerLoraManager};
pub use mapper::WeightsMapper;
pub use path::{fetch_adapter, resolve_adapter_path};
pub use peft::{PeftConfig, TargetModules};
pub use types::{
    LoraAdapter, LoraModel, LoraRequest, LoraRequestParts, PathLoraRequest, TensorLoraRequest,
};
pub use worker::WorkerLoraManager;
