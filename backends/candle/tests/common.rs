use anyhow::Result;
use candle::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use multitask_backend_candle::Qwen2Config;
use multitask_backend_core::Batch;
use serde_json::json;
use std::cmp::max;
use tempfile::TempDir;

pub fn tiny_qwen2_config(hidden_size: usize) -> serde_json::Value {
    json!({
        "architectures": ["Qwen2ForCausalLM"],
        "model_type": "qwen2",
        "vocab_size": 64,
        "hidden_size": hidden_size,
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
    })
}

/// Write a randomly initialized Qwen2 checkpoint (`config.json` + `model.safetensors`)
pub fn tiny_model(hidden_size: usize) -> Result<TempDir> {
    let dir = tempfile::tempdir()?;

    let config_json = tiny_qwen2_config(hidden_size);
    std::fs::write(
        dir.path().join("config.json"),
        serde_json::to_string_pretty(&config_json)?,
    )?;

    let config: Qwen2Config = serde_json::from_value(config_json)?;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    candle_transformers::models::qwen2::Model::new(&config, vb)?;
    varmap.save(dir.path().join("model.safetensors"))?;

    Ok(dir)
}

pub fn batch(sequences: Vec<Vec<u32>>) -> Batch {
    let mut input_ids = Vec::new();
    let mut position_ids = Vec::new();
    let mut cumulative_seq_lengths = Vec::with_capacity(sequences.len() + 1);
    cumulative_seq_lengths.push(0);

    let mut max_length = 0;
    let mut cumulative_length = 0;

    for sequence in sequences {
        let length = sequence.len() as u32;
        input_ids.extend(sequence);
        position_ids.extend(0..length);
        cumulative_length += length;
        cumulative_seq_lengths.push(cumulative_length);
        max_length = max(max_length, length);
    }

    Batch {
        input_ids,
        position_ids,
        cumulative_seq_lengths,
        max_length,
    }
}

pub fn norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}

pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    dot / (norm(a) * norm(b))
}
