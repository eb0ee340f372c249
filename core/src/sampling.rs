//! Candidate selection over a score vector: softmax, top-k truncation, top-p cut and optional
//! temperature-scaled sampling without replacement.

use rand::distributions::WeightedError;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SamplingError {
    #[error("Invalid sampling request: {0}")]
    InvalidSampling(String),
    #[error("Weighted draw failed: {0}")]
    Weighted(#[from] WeightedError),
}

/// Sampling configuration.
///
/// `temperature` ranges over `(-1, +inf)`: the higher, the flatter the sampling weights.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub do_sample: bool,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            do_sample: false,
            temperature: 0.0,
            top_p: 0.2,
            top_k: 50,
        }
    }
}

impl SamplingConfig {
    /// Exponent applied to the kept probabilities before the weighted draw
    pub fn sampling_exponent(&self) -> f32 {
        10.0 / (self.temperature + 1.0)
    }

    fn validate(&self) -> Result<(), SamplingError> {
        if !self.top_p.is_finite() {
            return Err(SamplingError::InvalidSampling(format!(
                "`top_p` must be finite, got {}",
                self.top_p
            )));
        }
        if self.do_sample && !(self.temperature.is_finite() && self.temperature > -1.0) {
            return Err(SamplingError::InvalidSampling(format!(
                "`temperature` must be in (-1, +inf), got {}",
                self.temperature
            )));
        }
        Ok(())
    }
}

/// Kept candidates: `indices[i]` is the candidate at rank `positions[i]`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub indices: Vec<usize>,
    pub positions: Vec<usize>,
}

impl Selection {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Subtract the mean and divide by the (unbiased) standard deviation, in place.
///
/// A constant or single-element heatmap is only centered.
pub fn standardize(heatmap: &mut [f32]) {
    let n = heatmap.len();
    if n == 0 {
        return;
    }

    let mean = heatmap.iter().sum::<f32>() / n as f32;
    heatmap.iter_mut().for_each(|v| *v -= mean);

    if n < 2 {
        return;
    }
    let std = (heatmap.iter().map(|v| v * v).sum::<f32>() / (n - 1) as f32).sqrt();
    if std > 0.0 {
        heatmap.iter_mut().for_each(|v| *v /= std);
    }
}

pub fn softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = scores.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exp.iter().sum();
    exp.into_iter().map(|v| v / sum).collect()
}

/// Reduce a heatmap over candidates to a ranked shortlist.
///
/// The heatmap is turned into probabilities, sorted, truncated to `top_k`, then cut to the `m`
/// first entries whose cumulative mass stays below `top_p` of the mass of the truncated slice.
/// Without sampling these `m` entries are returned in rank order. With sampling, `m` ranks are
/// drawn without replacement from the top-k slice with weights `p^(10 / (temperature + 1))` and
/// returned in ascending rank order.
pub fn select_scores<R: Rng + ?Sized>(
    heatmap: &mut [f32],
    config: &SamplingConfig,
    standardize_scores: bool,
    rng: &mut R,
) -> Result<Selection, SamplingError> {
    config.validate()?;
    if heatmap.is_empty() {
        return Err(SamplingError::InvalidSampling(
            "`heatmap` cannot be empty".to_string(),
        ));
    }

    if standardize_scores {
        standardize(heatmap);
    }

    let p = softmax(heatmap);

    let mut ind: Vec<usize> = (0..p.len()).collect();
    ind.sort_by(|&a, &b| p[b].total_cmp(&p[a]));
    ind.truncate(config.top_k);
    let val: Vec<f32> = ind.iter().map(|&i| p[i]).collect();

    let threshold = val.iter().sum::<f32>() * config.top_p;
    let m = val
        .iter()
        .scan(0.0f32, |cumsum, v| {
            *cumsum += v;
            Some(*cumsum)
        })
        .filter(|&cumsum| cumsum < threshold)
        .count();

    if !config.do_sample {
        return Ok(Selection {
            indices: ind[..m].to_vec(),
            positions: (0..m).collect(),
        });
    }

    // Relative to the top probability so the weights stay representable for large exponents
    let exponent = config.sampling_exponent() as f64;
    let top = val.first().copied().unwrap_or(1.0) as f64;
    let weights: Vec<f64> = val
        .iter()
        .map(|&v| (v as f64 / top).powf(exponent))
        .collect();

    let nonzero = weights.iter().filter(|&&w| w > 0.0).count();
    if nonzero < m {
        return Err(SamplingError::InvalidSampling(format!(
            "cannot draw {m} candidates from {nonzero} nonzero sampling weights"
        )));
    }
    let ranks: Vec<usize> = (0..val.len()).collect();

    let mut positions: Vec<usize> = ranks
        .choose_multiple_weighted(rng, m, |&rank| weights[rank])?
        .copied()
        .collect();
    positions.sort_unstable();

    Ok(Selection {
        indices: positions.iter().map(|&rank| ind[rank]).collect(),
        positions,
    })
}
