/// Multitask LM runner
mod logging;

pub use logging::init_logging;

use anyhow::{Context, Result};
use multitask_backend_candle::{CandleBackend, HeadsConfig};
use multitask_backend_core::DType;
use multitask_core::download::model_root;
use multitask_core::tokenization::{load_tokenizer, Tokenization};
use multitask_core::{Input, MultitaskConfig, MultitaskLM};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Outputs of one classify + select pass over a single text
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub text: String,
    pub num_tokens: usize,
    pub logits: Vec<f32>,
    pub selected: Vec<usize>,
}

#[derive(Debug, Deserialize)]
struct ModelConfig {
    max_position_embeddings: usize,
}

fn max_input_length(model_root: &Path, max_input_length: Option<usize>) -> Result<usize> {
    let config_path = model_root.join("config.json");
    let config = std::fs::read_to_string(&config_path)
        .with_context(|| format!("`config.json` not found in {model_root:?}"))?;
    let config: ModelConfig =
        serde_json::from_str(&config).context("Failed to parse `config.json`")?;

    Ok(match max_input_length {
        Some(max_input_length) => max_input_length.min(config.max_position_embeddings),
        None => config.max_position_embeddings,
    })
}

#[allow(clippy::too_many_arguments)]
pub fn run(
    model_id: String,
    revision: Option<String>,
    dtype: Option<DType>,
    heads: HeadsConfig,
    config: MultitaskConfig,
    index_path: PathBuf,
    text: String,
    max_input_length: Option<usize>,
    auto_truncate: bool,
    hf_token: Option<String>,
    huggingface_hub_cache: Option<String>,
    seed: Option<u64>,
) -> Result<Report> {
    let start = Instant::now();

    let model_root = model_root(
        &model_id,
        revision,
        hf_token,
        huggingface_hub_cache.map(PathBuf::from),
    )?;

    let max_input_length = self::max_input_length(&model_root, max_input_length)?;
    let tokenizer = load_tokenizer(&model_root)?;
    let tokenization = Tokenization::new(tokenizer, max_input_length, auto_truncate)?;

    let dtype = dtype.unwrap_or_default();
    tracing::info!("Starting model backend with dtype {dtype}");
    let backend = CandleBackend::new(&model_root, dtype, heads)
        .context("Could not create backend")?;

    let model = MultitaskLM::new(backend, &index_path, config)?;
    tracing::info!("Ready in {:?}", start.elapsed());

    let mut rng = match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy(),
    };

    let batch = tokenization.encode(&[&text])?;
    let num_tokens = batch.input_ids.len();

    let mut session = model.session();
    let logits = session
        .classify(Input::Batch(batch))?
        .into_iter()
        .next()
        .unwrap_or_default();
    let selected = session.select(Input::Previous, &mut rng)?;

    Ok(Report {
        text,
        num_tokens,
        logits,
        selected,
    })
}
