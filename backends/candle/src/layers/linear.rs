use candle::{DType, Device, Result, Tensor};
use candle_nn::VarBuilder;
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use std::path::Path;

#[derive(Debug)]
pub struct Linear {
    weight: Tensor,
    span: tracing::Span,
}

impl Linear {
    pub fn new(weight: Tensor) -> Self {
        let span = tracing::span!(tracing::Level::TRACE, "linear");

        Self { weight, span }
    }

    /// Load a bias-free projection from a single-tensor checkpoint (`weight`, shape `(out, in)`).
    ///
    /// `.safetensors` files are memory mapped, anything else is read as a PyTorch state dict.
    pub fn load(
        path: &Path,
        in_features: usize,
        out_features: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let vb = match path.extension().and_then(|ext| ext.to_str()) {
            Some("safetensors") => unsafe {
                VarBuilder::from_mmaped_safetensors(&[path], dtype, device)
            }?,
            _ => VarBuilder::from_pth(path, dtype, device)?,
        };
        let weight = vb.get((out_features, in_features), "weight")?;
        Ok(Self::new(weight))
    }

    /// Random initialization matching `torch.nn.Linear`: `U(-1/sqrt(in), 1/sqrt(in))`
    pub fn random<R: Rng>(
        rng: &mut R,
        in_features: usize,
        out_features: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let bound = 1.0 / (in_features as f32).sqrt();
        let uniform = Uniform::new_inclusive(-bound, bound);
        let values: Vec<f32> = (0..in_features * out_features)
            .map(|_| uniform.sample(rng))
            .collect();
        let weight =
            Tensor::from_vec(values, (out_features, in_features), device)?.to_dtype(dtype)?;
        Ok(Self::new(weight))
    }

    pub fn in_features(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();

        let w = match x.dims() {
            &[bsize, _, _] => self.weight.broadcast_left(bsize)?.t()?,
            _ => self.weight.t()?,
        };
        x.matmul(&w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_random_init_bounds() -> Result<()> {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let linear = Linear::random(&mut rng, 16, 4, DType::F32, &Device::Cpu)?;

        assert_eq!(linear.in_features(), 16);
        assert_eq!(linear.out_features(), 4);

        let values = linear.weight().flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| v.abs() <= 0.25));
        Ok(())
    }

    #[test]
    fn test_random_init_is_seeded() -> Result<()> {
        let a = Linear::random(&mut ChaCha8Rng::seed_from_u64(7), 8, 2, DType::F32, &Device::Cpu)?;
        let b = Linear::random(&mut ChaCha8Rng::seed_from_u64(7), 8, 2, DType::F32, &Device::Cpu)?;

        assert_eq!(
            a.weight().flatten_all()?.to_vec1::<f32>()?,
            b.weight().flatten_all()?.to_vec1::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn test_forward() -> Result<()> {
        let weight = Tensor::new(&[[1f32, 0., 0.], [0., 2., 1.]], &Device::Cpu)?;
        let linear = Linear::new(weight);

        let x = Tensor::new(&[[1f32, 2., 3.]], &Device::Cpu)?;
        let y = linear.forward(&x)?.to_vec2::<f32>()?;
        assert_eq!(y, vec![vec![1., 7.]]);
        Ok(())
    }

    #[test]
    fn test_load_safetensors() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("head.safetensors");

        let weight = Tensor::new(&[[0.5f32, -0.5], [1., 1.], [0., 2.]], &Device::Cpu)?;
        candle::safetensors::save(
            &std::collections::HashMap::from([("weight".to_string(), weight)]),
            &path,
        )?;

        let linear = Linear::load(&path, 2, 3, DType::F32, &Device::Cpu)?;
        assert_eq!(linear.out_features(), 3);
        assert_eq!(
            linear.weight().to_vec2::<f32>()?,
            vec![vec![0.5, -0.5], vec![1., 1.], vec![0., 2.]]
        );

        assert!(Linear::load(&path, 4, 3, DType::F32, &Device::Cpu).is_err());
        Ok(())
    }
}
