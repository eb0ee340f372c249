use anyhow::Result;
use candle::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use multitask_backend_candle::{HeadsConfig, Qwen2Config};
use multitask_core::VectorIndex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::json;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const HIDDEN_SIZE: usize = 16;
pub const PROJECTION_DIM: usize = 8;

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
        "vocab": {"[UNK]": 0, "hello": 1, "yann": 2, "lecun": 3},
        "unk_token": "[UNK]"
    }
}"#;

/// Local model directory: random Qwen2 weights, config and tokenizer
pub fn tiny_model() -> Result<TempDir> {
    let dir = tempfile::tempdir()?;

    let config_json = json!({
        "architectures": ["Qwen2ForCausalLM"],
        "model_type": "qwen2",
        "vocab_size": 32,
        "hidden_size": HIDDEN_SIZE,
        "intermediate_size": 32,
        "num_hidden_layers": 1,
        "num_attention_heads": 4,
        "num_key_value_heads": 2,
        "max_position_embeddings": 16,
        "sliding_window": 16,
        "max_window_layers": 1,
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

pub fn heads_config() -> HeadsConfig {
    HeadsConfig {
        n_features: HIDDEN_SIZE,
        num_candidates: 10,
        projection_dim: PROJECTION_DIM,
        seed: Some(3),
        ..Default::default()
    }
}

pub fn random_index(dir: &Path, n: usize) -> Result<PathBuf> {
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    let vectors = (0..n)
        .map(|_| (0..PROJECTION_DIM).map(|_| rng.gen_range(-1.0..1.0)).collect())
        .collect();

    let path = dir.join("etfs.index");
    VectorIndex::build(PROJECTION_DIM, vectors)?.persist(&path)?;
    Ok(path)
}
