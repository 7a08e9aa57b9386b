//! Adapter location resolution.

use std::path::{Path, PathBuf};

use hf_hub::{api::sync::Api, Repo, RepoType};

/// Resolve an adapter reference to a local directory.
///
/// - absolute paths are returned unchanged, whether or not they exist
/// - `~` is expanded to the home directory
/// - existing relative paths are made absolute
/// - anything else is treated as a HuggingFace Hub repo id and downloaded;
///   if that fails the input is returned unchanged and the subsequent
///   config read reports the missing files
pub fn resolve_adapter_path(lora_path: &str) -> PathBuf {
    let path = Path::new(lora_path);
    if path.is_absolute() {
        return path.to_path_buf();
    }

    if let Some(rest) = lora_path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest.trim_start_matches(['/', '\\']));
        }
        return path.to_path_buf();
    }

    if path.exists() {
        return std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    }

    match fetch_adapter(lora_path) {
        Ok(local) => local,
        Err(e) => {
            tracing::warn!(
                lora_path,
                error = %e,
                "Adapter path not found locally and hub download failed"
            );
            path.to_path_buf()
        }
    }
}

/// Downloads adapter files from HuggingFace Hub (or uses cache).
///
/// Returns the snapshot directory holding `adapter_config.json`.
pub fn fetch_adapter(repo_id: &str) -> anyhow::Result<PathBuf> {
    let api = Api::new()?;
    let repo = api.repo(Repo::new(repo_id.to_string(), RepoType::Model));

    let config_path = repo.get("adapter_config.json")?;

    // Weights: safetensors first, then pickle formats
    let mut weights_found = false;
    for filename in [
        "adapter_model.safetensors",
        "adapter_model.bin",
        "adapter_model.pt",
    ] {
        if repo.get(filename).is_ok() {
            weights_found = true;
            break;
        }
    }
    if !weights_found {
        anyhow::bail!("no adapter weights in hub repo {repo_id}");
    }

    // Added-vocabulary embeddings are optional
    if repo.get("new_embeddings.safetensors").is_err() {
        let _ = repo.get("new_embeddings.bin");
    }

    let dir = config_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Failed to get parent directory"))?;
    tracing::info!(repo_id, path = %dir.display(), "Fetched LoRA adapter from hub");
    Ok(dir.to_path_buf())
}
