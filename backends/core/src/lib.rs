#[cfg(feature = "clap")]
use clap::ValueEnum;
use serde::Deserialize;
use std::fmt;
use std::ops::Range;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Batch {
    pub input_ids: Vec<u32>,
    pub position_ids: Vec<u32>,
    pub cumulative_seq_lengths: Vec<u32>,
    pub max_length: u32,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.cumulative_seq_lengths.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Token range of the `i`-th sequence inside `input_ids`
    pub fn range(&self, i: usize) -> Range<usize> {
        self.cumulative_seq_lengths[i] as usize..self.cumulative_seq_lengths[i + 1] as usize
    }
}

pub type Embeddings = Vec<Vec<f32>>;
pub type Predictions = Vec<Vec<f32>>;

/// Linear heads applied on top of the normalized embedding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Head {
    /// Binary classification, 2 logits
    Classification,
    /// One logit per candidate item
    Selection,
    /// Projection to the vector index width
    Projection,
}

impl fmt::Display for Head {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Head::Classification => write!(f, "classification"),
            Head::Selection => write!(f, "selection"),
            Head::Projection => write!(f, "projection"),
        }
    }
}

pub trait Backend {
    /// Output of one forward pass of the model body
    type State;

    fn health(&self) -> Result<(), BackendError>;

    fn hidden_size(&self) -> usize;

    fn output_size(&self, head: Head) -> usize;

    fn forward(&self, batch: Batch) -> Result<Self::State, BackendError>;

    fn embed(&self, state: &Self::State) -> Result<Embeddings, BackendError>;

    fn predict(&self, state: &Self::State, head: Head) -> Result<Predictions, BackendError>;
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Copy, Deserialize)]
#[cfg_attr(feature = "clap", derive(ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Float16,
    #[default]
    Float32,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DType::Float16 => write!(f, "float16"),
            DType::Float32 => write!(f, "float32"),
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum BackendError {
    #[error("Could not start backend: {0}")]
    Start(String),
    #[error("{0}")]
    Inference(String),
    #[error("Backend is unhealthy")]
    Unhealthy,
}
