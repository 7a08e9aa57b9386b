use candle_core::{DType, Device};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tensor_lora_core::{
    lora::{
        LoraDtype, LoraModel, LoraRequest, LoraRequestParts, ModelLoraLayout, WorkerLoraManager,
    },
    version,
};

use tensor_lora_cli::config::CliConfig;
use tensor_lora_cli::logging;

#[derive(Parser)]
#[command(name = "tensor-lora", about = "Load and validate LoRA adapters")]
struct Cli {
    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a PEFT adapter from disk or the HuggingFace Hub and print a summary
    Load {
        /// Adapter directory or HuggingFace Hub repo id
        path: String,

        /// Adapter name
        #[arg(long, default_value = "adapter")]
        name: String,

        /// Adapter id (must be > 0)
        #[arg(long, default_value_t = 1)]
        id: u32,

        /// Base model architecture (e.g. LlamaForCausalLM)
        #[arg(long)]
        architecture: Option<String>,

        /// Base model vocabulary size
        #[arg(long)]
        vocab_size: Option<usize>,

        /// Base model context length
        #[arg(long)]
        max_position_embeddings: Option<usize>,

        /// Maximum LoRA rank
        #[arg(long)]
        max_lora_rank: Option<usize>,

        /// Adapters active in a single batch
        #[arg(long)]
        max_loras: Option<usize>,

        /// Adapters kept in the CPU cache
        #[arg(long)]
        max_cpu_loras: Option<usize>,

        /// Vocabulary rows reserved for adapter-added tokens
        #[arg(long)]
        lora_extra_vocab_size: Option<usize>,

        /// Data type for LoRA weights (auto, fp16, bf16, fp32)
        #[arg(long)]
        lora_dtype: Option<String>,

        /// Base model data type (auto, bf16, fp16, fp32), used when lora_dtype is auto
        #[arg(long, default_value = "fp32")]
        dtype: String,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,

        /// Persist the effective settings to the config file
        #[arg(long)]
        save_config: bool,
    },

    /// Check that an installed package is at least a minimum version
    CheckVersion {
        /// Package name
        package: String,

        /// Minimum version (PEP 440)
        minver: String,

        /// Register an installed package, as name=version (repeatable)
        #[arg(long = "installed", value_parser = parse_installed)]
        installed: Vec<(String, String)>,
    },
}

fn parse_installed(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, version)) if !name.is_empty() && !version.is_empty() => {
            Ok((name.to_string(), version.to_string()))
        }
        _ => Err(format!("expected name=version, got '{s}'")),
    }
}

/// Base model dtype. `auto` resolves to fp32.
fn parse_dtype(dtype: &str) -> anyhow::Result<DType> {
    LoraDtype::parse(dtype)
        .map(|d| d.resolve(DType::F32))
        .ok_or_else(|| {
            anyhow::anyhow!(
                "Unknown dtype '{}'. Supported: auto, bf16, fp16, fp32",
                dtype
            )
        })
}

/// What `tensor-lora load` reports.
#[derive(Debug, Serialize)]
struct AdapterSummary {
    name: String,
    id: u32,
    rank: usize,
    alpha: f32,
    num_modules: usize,
    extra_vocab_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    scaling_factor: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_path: Option<String>,
    modules: Vec<String>,
}

impl From<&LoraModel> for AdapterSummary {
    fn from(lora: &LoraModel) -> Self {
        let mut modules: Vec<String> = lora.adapters.keys().cloned().collect();
        modules.sort();
        Self {
            name: lora.name.clone(),
            id: lora.id,
            rank: lora.rank,
            alpha: lora.alpha,
            num_modules: lora.num_adapters(),
            extra_vocab_size: lora.extra_vocab_size(),
            scaling_factor: lora.scaling_factor,
            source_path: lora.source_path.as_ref().map(|p| p.display().to_string()),
            modules,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_with_level(&cli.log_level);

    match cli.command {
        Command::Load {
            path,
            name,
            id,
            architecture,
            vocab_size,
            max_position_embeddings,
            max_lora_rank,
            max_loras,
            max_cpu_loras,
            lora_extra_vocab_size,
            lora_dtype,
            dtype,
            json,
            save_config,
        } => {
            let mut config = CliConfig::load();
            if let Some(config_path) = CliConfig::default_path() {
                if config_path.exists() {
                    eprintln!("Loaded config from: {}", config_path.display());
                }
            }
            config.merge(&CliConfig {
                max_lora_rank,
                max_loras,
                max_cpu_loras,
                lora_extra_vocab_size,
                lora_dtype,
                bias_enabled: None,
                architecture,
                vocab_size,
                max_position_embeddings,
            });

            let lora_config = config.to_lora_config()?;
            let architecture = config
                .architecture
                .clone()
                .unwrap_or_else(|| "LlamaForCausalLM".to_string());
            let layout = ModelLoraLayout::for_architecture(&architecture).ok_or_else(|| {
                anyhow::anyhow!("Architecture '{}' does not support LoRA", architecture)
            })?;
            let vocab_size = config.vocab_size.ok_or_else(|| {
                anyhow::anyhow!("--vocab-size is required (or set vocab_size in the config file)")
            })?;
            let model_dtype = parse_dtype(&dtype)?;

            let mut worker =
                WorkerLoraManager::new(lora_config, layout, vocab_size, Device::Cpu, model_dtype);
            if let Some(max_pos) = config.max_position_embeddings {
                worker = worker.with_max_position_embeddings(max_pos);
            }

            let request = LoraRequest::from_parts(LoraRequestParts {
                name,
                id,
                path: Some(path),
                ..Default::default()
            })?;
            let lora = worker.load_adapter(&request)?;
            let summary = AdapterSummary::from(&lora);

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("Loaded LoRA adapter '{}' (id {})", summary.name, summary.id);
                println!("  rank: {}, alpha: {}", summary.rank, summary.alpha);
                println!("  modules: {}", summary.num_modules);
                println!("  extra vocab: {}", summary.extra_vocab_size);
                if let Some(factor) = summary.scaling_factor {
                    println!("  long-context scaling: {factor}");
                }
                if let Some(source) = &summary.source_path {
                    println!("  source: {source}");
                }
                for module in &summary.modules {
                    println!("    {module}");
                }
            }

            if save_config {
                let config_path = config.save()?;
                eprintln!("Saved config to: {}", config_path.display());
            }
        }

        Command::CheckVersion {
            package,
            minver,
            installed,
        } => {
            for (name, installed_version) in installed {
                version::register_package(&name, installed_version);
            }
            let ok = version::is_version_ge(&package, &minver)?;
            let current = version::installed_version(&package)?;
            println!("{package} {current} >= {minver}: {ok}");
            if !ok {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
