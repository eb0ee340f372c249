use crate::models::Model;
use candle::{Device, Result, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::qwen2;
use multitask_backend_core::Batch;
use std::sync::Mutex;

pub use qwen2::Config as Qwen2Config;

/// Qwen2 causal LM body without its `lm_head`.
///
/// Only the last hidden state (after the final norm) is used. The underlying model keeps a KV
/// cache and needs `&mut self`, so it sits behind a `Mutex` and the cache is cleared before every
/// sequence.
pub struct Qwen2Model {
    inner: Mutex<qwen2::Model>,
    hidden_size: usize,
    device: Device,

    span: tracing::Span,
}

impl Qwen2Model {
    pub fn load(vb: VarBuilder, config: &Qwen2Config) -> Result<Self> {
        if config.use_sliding_window {
            candle::bail!("Sliding window is not supported for Qwen2");
        }

        let device = vb.device().clone();
        let inner = qwen2::Model::new(config, vb)?;

        Ok(Self {
            inner: Mutex::new(inner),
            hidden_size: config.hidden_size,
            device,
            span: tracing::span!(tracing::Level::TRACE, "model"),
        })
    }
}

impl Model for Qwen2Model {
    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn forward(&self, batch: &Batch) -> Result<Vec<Tensor>> {
        let _enter = self.span.enter();

        let mut model = match self.inner.lock() {
            Ok(model) => model,
            Err(_) => candle::bail!("Qwen2 model lock is poisoned"),
        };

        // Sequences run one by one with a causal mask: no padding ever enters the hidden states
        (0..batch.len())
            .map(|i| {
                let ids = &batch.input_ids[batch.range(i)];
                if ids.is_empty() {
                    candle::bail!("sequence {i} of the batch is empty");
                }

                model.clear_kv_cache();
                let input_ids = Tensor::new(ids, &self.device)?.unsqueeze(0)?;
                let hidden_states = model.forward(&input_ids, 0, None)?;
                hidden_states.squeeze(0)
            })
            .collect()
    }
}
