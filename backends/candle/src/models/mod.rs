#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

use candle::{Result, Tensor};
use multitask_backend_core::Batch;

mod heads;
mod qwen2;

pub use heads::{
    HeadsConfig, MultitaskHeads, DEFAULT_NUM_CANDIDATES, DEFAULT_N_FEATURES,
    DEFAULT_PROJECTION_DIM,
};
pub use qwen2::{Qwen2Config, Qwen2Model};

pub(crate) trait Model {
    fn hidden_size(&self) -> usize;

    /// Last hidden state of every sequence in the batch, each of shape `(seq_len, hidden_size)`
    fn forward(&self, batch: &Batch) -> Result<Vec<Tensor>>;
}
