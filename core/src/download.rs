use crate::MultitaskError;
use hf_hub::api::sync::{ApiBuilder, ApiError, ApiRepo};
use hf_hub::{Repo, RepoType};
use std::path::{Path, PathBuf};
use tracing::instrument;

fn download_file(api: &ApiRepo, file_path: &str) -> Result<PathBuf, ApiError> {
    tracing::info!("Downloading `{}`", file_path);
    api.get(file_path)
}

/// Build a hub handle for `model_id` at `revision`
pub fn api_repo(
    model_id: &str,
    revision: Option<String>,
    token: Option<String>,
    cache_dir: Option<PathBuf>,
) -> Result<ApiRepo, MultitaskError> {
    let mut builder = ApiBuilder::new()
        .with_progress(false)
        .with_token(token);

    if let Some(cache_dir) = cache_dir {
        builder = builder.with_cache_dir(cache_dir);
    }

    let api = builder.build()?;
    let repo = match revision {
        Some(revision) => Repo::with_revision(model_id.to_string(), RepoType::Model, revision),
        None => Repo::new(model_id.to_string(), RepoType::Model),
    };
    Ok(api.repo(repo))
}

fn download_safetensors(api: &ApiRepo) -> Result<Vec<PathBuf>, MultitaskError> {
    // Single file
    match download_file(api, "model.safetensors") {
        Ok(p) => return Ok(vec![p]),
        Err(err) => tracing::warn!("Could not download `model.safetensors`: {}", err),
    };

    // Sharded weights
    let index_file = download_file(api, "model.safetensors.index.json")?;
    let index_file_string = std::fs::read_to_string(&index_file).map_err(|err| {
        MultitaskError::Artifacts(format!("could not read {index_file:?}: {err}"))
    })?;
    let json: serde_json::Value = serde_json::from_str(&index_file_string).map_err(|err| {
        MultitaskError::Artifacts(format!("{index_file:?} is corrupted: {err}"))
    })?;

    let weight_map = match json.get("weight_map") {
        Some(serde_json::Value::Object(map)) => map,
        _ => {
            return Err(MultitaskError::Artifacts(format!(
                "{index_file:?} does not contain a `weight_map`"
            )))
        }
    };

    let mut safetensors_filenames = std::collections::BTreeSet::new();
    for value in weight_map.values() {
        if let Some(file) = value.as_str() {
            safetensors_filenames.insert(file.to_string());
        }
    }

    let mut safetensors_files = Vec::with_capacity(safetensors_filenames.len());
    for filename in &safetensors_filenames {
        safetensors_files.push(download_file(api, filename)?);
    }

    Ok(safetensors_files)
}

/// Fetch config, tokenizer and weights; returns the local model directory
#[instrument(skip_all)]
pub fn download_artifacts(api: &ApiRepo) -> Result<PathBuf, MultitaskError> {
    let start = std::time::Instant::now();
    tracing::info!("Starting download");

    let config_path = download_file(api, "config.json")?;
    download_file(api, "tokenizer.json")?;

    if let Err(err) = download_safetensors(api) {
        tracing::warn!("safetensors weights not found ({err}). Using `pytorch_model.bin` instead. Model loading will be significantly slower.");
        download_file(api, "pytorch_model.bin")?;
    }

    tracing::info!("Model artifacts downloaded in {:?}", start.elapsed());

    config_path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| MultitaskError::Artifacts(format!("{config_path:?} has no parent")))
}

/// Resolve `model_id` to a local directory, downloading from the hub unless it already is one
pub fn model_root(
    model_id: &str,
    revision: Option<String>,
    token: Option<String>,
    cache_dir: Option<PathBuf>,
) -> Result<PathBuf, MultitaskError> {
    let path = Path::new(model_id);
    if path.is_dir() {
        tracing::info!("Using local model directory {path:?}");
        return Ok(path.to_path_buf());
    }

    let api = api_repo(model_id, revision, token, cache_dir)?;
    download_artifacts(&api)
}
