pub mod download;
pub mod index;
pub mod multitask;
pub mod sampling;
pub mod tokenization;

use hf_hub::api::sync::ApiError;
use multitask_backend_core::BackendError;
use thiserror::Error;

pub use index::{IndexError, SearchHit, VectorIndex};
pub use multitask::{Input, MultitaskConfig, MultitaskLM, Session};
pub use sampling::{select_scores, SamplingConfig, SamplingError, Selection};

#[derive(Error, Debug)]
pub enum MultitaskError {
    #[error("tokenizer error {0}")]
    Tokenizer(#[from] tokenizers::Error),
    #[error("Input validation error: {0}")]
    Validation(String),
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("Index error: {0}")]
    Index(#[from] IndexError),
    #[error("Sampling error: {0}")]
    Sampling(#[from] SamplingError),
    #[error("Projection width {actual} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("No previous forward pass to reuse")]
    NoPreviousForward,
    #[error("Download error: {0}")]
    Download(#[from] ApiError),
    #[error("Invalid model artifacts: {0}")]
    Artifacts(String),
}

impl MultitaskError {
    /// Label used for the `mt_request_failure` counter
    pub fn error_type(&self) -> &'static str {
        match self {
            MultitaskError::Tokenizer(_) => "tokenizer",
            MultitaskError::Validation(_) => "validation",
            MultitaskError::Backend(_) => "backend",
            MultitaskError::Index(_) => "index",
            MultitaskError::Sampling(_) => "sampling",
            MultitaskError::DimensionMismatch { .. } => "dimension",
            MultitaskError::NoPreviousForward => "no_previous_forward",
            MultitaskError::Download(_) => "download",
            MultitaskError::Artifacts(_) => "artifacts",
        }
    }
}
