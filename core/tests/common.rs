use anyhow::Result;
use candle::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use multitask_backend_candle::{CandleBackend, HeadsConfig, Qwen2Config};
use multitask_backend_core::DType as BackendDType;
use multitask_core::VectorIndex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::json;
use std::path::Path;
use tempfile::TempDir;

pub const HIDDEN_SIZE: usize = 16;
pub const PROJECTION_DIM: usize = 8;
pub const NUM_CANDIDATES: usize = 32;

const TOKENIZER_JSON: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [],
    "normalizer": null,
    "pre_tokenizer": {"type": "Whitespace"},
    "post_processor": null,
    "decoder": null,
    "model": {
        "type": "WordLevel",
        "vocab": {
            "[UNK]": 0, "the": 1, "fund": 2, "tracks": 3, "large": 4, "cap": 5,
            "technology": 6, "stocks": 7, "bonds": 8, "with": 9, "low": 10, "fees": 11
        },
        "unk_token": "[UNK]"
    }
}"#;

/// Write a random Qwen2 checkpoint and a word level tokenizer to a temporary directory
pub fn tiny_model() -> Result<TempDir> {
    let dir = tempfile::tempdir()?;

    let config_json = json!({
        "architectures": ["Qwen2ForCausalLM"],
        "model_type": "qwen2",
        "vocab_size": 64,
        "hidden_size": HIDDEN_SIZE,
        "intermediate_size": 32,
        "num_hidden_layers": 2,
        "num_attention_heads": 4,
        "num_key_value_heads": 2,
        "max_position_embeddings": 64,
        "sliding_window": 64,
        "max_window_layers": 2,
        "tie_word_embeddings": true,
        "rope_theta": 10000.0,
        "rms_norm_eps": 1e-6,
        "use_sliding_window": false,
        "hidden_act": "silu"
    });
    std::fs::write(
        dir.path().join("config.json"),
        serde_json::to_string_pretty(&config_json)?,
    )?;
    std::fs::write(dir.path().join("tokenizer.json"), TOKENIZER_JSON)?;

    let config: Qwen2Config = serde_json::from_value(config_json)?;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    candle_transformers::models::qwen2::Model::new(&config, vb)?;
    varmap.save(dir.path().join("model.safetensors"))?;

    Ok(dir)
}

pub fn backend(model_root: &Path, projection_dim: usize) -> Result<CandleBackend> {
    let heads = HeadsConfig {
        n_features: HIDDEN_SIZE,
        num_candidates: NUM_CANDIDATES,
        projection_dim,
        seed: Some(0),
        ..Default::default()
    };
    Ok(CandleBackend::new(
        model_root,
        BackendDType::Float32,
        heads,
    )?)
}

/// Persist an index of `n` random vectors and return its path
pub fn random_index(dir: &Path, n: usize, dimension: usize) -> Result<std::path::PathBuf> {
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let vectors = (0..n)
        .map(|_| (0..dimension).map(|_| rng.gen_range(-1.0..1.0)).collect())
        .collect();

    let path = dir.join("candidates.index");
    VectorIndex::build(dimension, vectors)?.persist(&path)?;
    Ok(path)
}

pub fn norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}
