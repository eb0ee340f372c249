use crate::layers::Linear;
use candle::{DType, Device, Result, Tensor};
use multitask_backend_core::Head;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Number of candidate items scored by the selection head
pub const DEFAULT_NUM_CANDIDATES: usize = 11796;
/// Width of the vectors stored in the candidate index
pub const DEFAULT_PROJECTION_DIM: usize = 384;
pub const DEFAULT_N_FEATURES: usize = 1024;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HeadsConfig {
    /// Hidden size of the model body
    pub n_features: usize,
    pub num_candidates: usize,
    pub projection_dim: usize,
    pub class_path: Option<PathBuf>,
    pub select_path: Option<PathBuf>,
    pub projection_path: Option<PathBuf>,
    /// Seed for the heads that are not loaded from a checkpoint
    pub seed: Option<u64>,
}

impl Default for HeadsConfig {
    fn default() -> Self {
        Self {
            n_features: DEFAULT_N_FEATURES,
            num_candidates: DEFAULT_NUM_CANDIDATES,
            projection_dim: DEFAULT_PROJECTION_DIM,
            class_path: None,
            select_path: None,
            projection_path: None,
            seed: None,
        }
    }
}

#[derive(Debug)]
pub struct MultitaskHeads {
    classification: Linear,
    selection: Linear,
    projection: Linear,
}

impl MultitaskHeads {
    pub fn load(config: &HeadsConfig, dtype: DType, device: &Device) -> Result<Self> {
        let mut rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };

        let mut load_head = |name: Head, path: Option<&Path>, out_features: usize| {
            match path {
                Some(path) => {
                    tracing::info!("Loading {name} head from {path:?}");
                    Linear::load(path, config.n_features, out_features, dtype, device)
                }
                None => {
                    tracing::warn!("No checkpoint for the {name} head, using random weights");
                    Linear::random(&mut rng, config.n_features, out_features, dtype, device)
                }
            }
        };

        let classification = load_head(Head::Classification, config.class_path.as_deref(), 2)?;
        let selection = load_head(
            Head::Selection,
            config.select_path.as_deref(),
            config.num_candidates,
        )?;
        let projection = load_head(
            Head::Projection,
            config.projection_path.as_deref(),
            config.projection_dim,
        )?;

        Ok(Self {
            classification,
            selection,
            projection,
        })
    }

    pub fn get(&self, head: Head) -> &Linear {
        match head {
            Head::Classification => &self.classification,
            Head::Selection => &self.selection,
            Head::Projection => &self.projection,
        }
    }

    pub fn forward(&self, head: Head, embeddings: &Tensor) -> Result<Tensor> {
        self.get(head).forward(embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> HeadsConfig {
        HeadsConfig {
            n_features: 8,
            num_candidates: 20,
            projection_dim: 4,
            seed: Some(3),
            ..Default::default()
        }
    }

    #[test]
    fn test_random_heads_shapes() -> Result<()> {
        let heads = MultitaskHeads::load(&small_config(), DType::F32, &Device::Cpu)?;

        assert_eq!(heads.get(Head::Classification).out_features(), 2);
        assert_eq!(heads.get(Head::Selection).out_features(), 20);
        assert_eq!(heads.get(Head::Projection).out_features(), 4);

        let x = Tensor::ones((3, 8), DType::F32, &Device::Cpu)?;
        assert_eq!(heads.forward(Head::Classification, &x)?.dims(), &[3, 2]);
        assert_eq!(heads.forward(Head::Projection, &x)?.dims(), &[3, 4]);
        Ok(())
    }

    #[test]
    fn test_checkpoint_overrides_random_init() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("class_head.safetensors");
        let weight = Tensor::ones((2, 8), DType::F32, &Device::Cpu)?;
        candle::safetensors::save(
            &std::collections::HashMap::from([("weight".to_string(), weight)]),
            &path,
        )?;

        let config = HeadsConfig {
            class_path: Some(path),
            ..small_config()
        };
        let heads = MultitaskHeads::load(&config, DType::F32, &Device::Cpu)?;

        let x = Tensor::ones((1, 8), DType::F32, &Device::Cpu)?;
        let logits = heads.forward(Head::Classification, &x)?.to_vec2::<f32>()?;
        assert_eq!(logits, vec![vec![8., 8.]]);
        Ok(())
    }

    #[test]
    fn test_missing_checkpoint_fails() {
        let config = HeadsConfig {
            select_path: Some(PathBuf::from("/nonexistent/select_head.pt")),
            ..small_config()
        };
        assert!(MultitaskHeads::load(&config, DType::F32, &Device::Cpu).is_err());
    }
}
