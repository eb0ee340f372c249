mod layers;
mod models;

use crate::models::{Model, MultitaskHeads, Qwen2Model};
use candle::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use multitask_backend_core::{
    Backend, BackendError, Batch, DType as BackendDType, Embeddings, Head, Predictions,
};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub use crate::models::{
    HeadsConfig, Qwen2Config, DEFAULT_NUM_CANDIDATES, DEFAULT_N_FEATURES, DEFAULT_PROJECTION_DIM,
};

/// Last hidden state of one forward pass, one `(seq_len, hidden_size)` tensor per input
#[derive(Debug, Clone)]
pub struct HiddenState {
    sequences: Vec<Tensor>,
}

impl HiddenState {
    pub fn new(sequences: Vec<Tensor>) -> Self {
        Self { sequences }
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn sequences(&self) -> &[Tensor] {
        &self.sequences
    }

    /// Average of the token vectors of every sequence, shape `(batch, hidden_size)`
    pub fn mean_pool(&self) -> candle::Result<Tensor> {
        if self.sequences.is_empty() {
            candle::bail!("cannot pool an empty hidden state");
        }
        let pooled = self
            .sequences
            .iter()
            .map(|sequence| sequence.mean_keepdim(0))
            .collect::<candle::Result<Vec<_>>>()?;
        Tensor::cat(&pooled, 0)
    }

    /// Mean pooled embeddings divided by the L2 norm of the whole `(batch, hidden_size)` matrix.
    ///
    /// The norm is a single scalar for the batch: rows are only unit norm for a batch of one.
    pub fn embeddings(&self) -> candle::Result<Tensor> {
        let pooled = self.mean_pool()?;
        let norm = pooled.sqr()?.sum_all()?.sqrt()?;
        pooled.broadcast_div(&norm)
    }
}

#[derive(Debug, Deserialize)]
struct ModelConfig {
    model_type: Option<String>,
}

enum WeightFiles {
    Safetensors(Vec<PathBuf>),
    Pth(PathBuf),
}

fn weight_files(model_path: &Path) -> Result<WeightFiles, BackendError> {
    let single = model_path.join("model.safetensors");
    if single.exists() {
        return Ok(WeightFiles::Safetensors(vec![single]));
    }

    // Sharded weights
    let index_path = model_path.join("model.safetensors.index.json");
    if index_path.exists() {
        let index: String = std::fs::read_to_string(&index_path)
            .map_err(|err| BackendError::Start(err.to_string()))?;
        let index: serde_json::Value =
            serde_json::from_str(&index).map_err(|err| BackendError::Start(err.to_string()))?;

        let weight_map = match index.get("weight_map") {
            Some(serde_json::Value::Object(map)) => map,
            _ => {
                return Err(BackendError::Start(format!(
                    "{index_path:?} does not contain a `weight_map`"
                )))
            }
        };
        let shards: BTreeSet<&str> = weight_map.values().filter_map(|v| v.as_str()).collect();
        return Ok(WeightFiles::Safetensors(
            shards.into_iter().map(|s| model_path.join(s)).collect(),
        ));
    }

    let pth = model_path.join("pytorch_model.bin");
    if pth.exists() {
        tracing::warn!("safetensors weights not found. Using `pytorch_model.bin` instead. Model loading will be significantly slower.");
        return Ok(WeightFiles::Pth(pth));
    }

    Err(BackendError::Start(format!(
        "No model weights found in {model_path:?}"
    )))
}

fn device() -> Result<Device, BackendError> {
    #[cfg(feature = "cuda")]
    {
        Device::cuda_if_available(0).s()
    }
    #[cfg(all(feature = "metal", not(feature = "cuda")))]
    {
        Device::new_metal(0).s()
    }
    #[cfg(not(any(feature = "cuda", feature = "metal")))]
    {
        Ok(Device::Cpu)
    }
}

pub struct CandleBackend {
    model: Box<dyn Model + Send + Sync>,
    heads: MultitaskHeads,
    dtype: DType,
    device: Device,
}

impl CandleBackend {
    pub fn new(
        model_path: &Path,
        dtype: BackendDType,
        heads: HeadsConfig,
    ) -> Result<Self, BackendError> {
        // Load config
        let config: String = std::fs::read_to_string(model_path.join("config.json"))
            .map_err(|err| BackendError::Start(err.to_string()))?;
        let model_config: ModelConfig =
            serde_json::from_str(&config).map_err(|err| BackendError::Start(err.to_string()))?;
        if let Some(model_type) = &model_config.model_type {
            if model_type != "qwen2" {
                return Err(BackendError::Start(format!(
                    "Model {model_type:?} is not supported"
                )));
            }
        }
        let config: Qwen2Config =
            serde_json::from_str(&config).map_err(|err| BackendError::Start(err.to_string()))?;

        if config.hidden_size != heads.n_features {
            return Err(BackendError::Start(format!(
                "Model hidden size {} does not match the configured number of features {}",
                config.hidden_size, heads.n_features
            )));
        }

        let device = device()?;
        let dtype = match dtype {
            BackendDType::Float32 => DType::F32,
            BackendDType::Float16 => DType::F16,
        };

        let vb = match weight_files(model_path)? {
            WeightFiles::Safetensors(files) => {
                tracing::info!("Loading weights from {files:?}");
                unsafe { VarBuilder::from_mmaped_safetensors(&files, dtype, &device) }
            }
            WeightFiles::Pth(file) => VarBuilder::from_pth(file, dtype, &device),
        }
        .s()?;

        tracing::info!("Starting Qwen2 model on {device:?}");
        let model = Qwen2Model::load(vb, &config).s()?;
        let heads = MultitaskHeads::load(&heads, dtype, &device).s()?;

        Ok(Self {
            model: Box::new(model),
            heads,
            dtype,
            device,
        })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl Backend for CandleBackend {
    type State = HiddenState;

    fn health(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn hidden_size(&self) -> usize {
        self.model.hidden_size()
    }

    fn output_size(&self, head: Head) -> usize {
        self.heads.get(head).out_features()
    }

    fn forward(&self, batch: Batch) -> Result<HiddenState, BackendError> {
        if batch.is_empty() {
            return Err(BackendError::Inference("batch is empty".to_string()));
        }
        let sequences = self.model.forward(&batch).e()?;
        Ok(HiddenState::new(sequences))
    }

    fn embed(&self, state: &HiddenState) -> Result<Embeddings, BackendError> {
        let embeddings = state.embeddings().e()?;
        tracing::debug!("Embedding shape: {:?}", embeddings.dims());
        embeddings.to_dtype(DType::F32).e()?.to_vec2::<f32>().e()
    }

    fn predict(&self, state: &HiddenState, head: Head) -> Result<Predictions, BackendError> {
        let embeddings = state.embeddings().e()?;
        let outputs = self.heads.forward(head, &embeddings).e()?;
        tracing::debug!("{head} head output shape: {:?}", outputs.dims());
        outputs.to_dtype(DType::F32).e()?.to_vec2::<f32>().e()
    }
}

pub trait WrapErr<O> {
    fn s(self) -> Result<O, BackendError>;
    fn e(self) -> Result<O, BackendError>;
}

impl<O> WrapErr<O> for Result<O, candle::Error> {
    fn s(self) -> Result<O, BackendError> {
        self.map_err(|e| BackendError::Start(e.to_string()))
    }
    fn e(self) -> Result<O, BackendError> {
        self.map_err(|e| BackendError::Inference(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> candle::Result<HiddenState> {
        let a = Tensor::new(&[[1f32, 0., 0.], [3., 0., 0.]], &Device::Cpu)?;
        let b = Tensor::new(&[[0f32, 4., 0.]], &Device::Cpu)?;
        Ok(HiddenState::new(vec![a, b]))
    }

    #[test]
    fn test_mean_pool() -> candle::Result<()> {
        let pooled = state()?.mean_pool()?.to_vec2::<f32>()?;
        assert_eq!(pooled, vec![vec![2., 0., 0.], vec![0., 4., 0.]]);
        Ok(())
    }

    #[test]
    fn test_embeddings_use_batch_norm() -> candle::Result<()> {
        // pooled rows are (2, 0, 0) and (0, 4, 0): the matrix norm is sqrt(20)
        let embeddings = state()?.embeddings()?.to_vec2::<f32>()?;
        let norm = 20f32.sqrt();
        assert!((embeddings[0][0] - 2. / norm).abs() < 1e-6);
        assert!((embeddings[1][1] - 4. / norm).abs() < 1e-6);

        let row_norm = |row: &Vec<f32>| row.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((row_norm(&embeddings[0]) - 1.).abs() > 1e-3);
        Ok(())
    }

    #[test]
    fn test_empty_state() {
        assert!(HiddenState::new(vec![]).embeddings().is_err());
    }
}
