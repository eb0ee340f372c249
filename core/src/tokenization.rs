/// Text to `Batch` tokenization
use crate::MultitaskError;
use multitask_backend_core::Batch;
use std::cmp::max;
use std::path::Path;
use tokenizers::tokenizer::Tokenizer;
use tokenizers::{TruncationDirection, TruncationParams, TruncationStrategy};
use tracing::instrument;

static MAX_CHAR_MULTIPLIER: usize = 250;

/// Load `tokenizer.json` from a model directory with padding disabled
pub fn load_tokenizer(model_root: &Path) -> Result<Tokenizer, MultitaskError> {
    let tokenizer_path = model_root.join("tokenizer.json");
    let mut tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|err| {
        MultitaskError::Artifacts(format!(
            "could not load tokenizer from {tokenizer_path:?}: {err}"
        ))
    })?;
    tokenizer.with_padding(None);
    Ok(tokenizer)
}

#[derive(Clone)]
pub struct Tokenization {
    tokenizer: Tokenizer,
    max_input_length: usize,
    truncate: bool,
}

impl Tokenization {
    pub fn new(
        mut tokenizer: Tokenizer,
        max_input_length: usize,
        truncate: bool,
    ) -> Result<Self, MultitaskError> {
        let truncate_params = truncate.then_some(TruncationParams {
            direction: TruncationDirection::Right,
            max_length: max_input_length,
            strategy: TruncationStrategy::LongestFirst,
            stride: 0,
        });
        tokenizer.with_padding(None);
        tokenizer.with_truncation(truncate_params)?;

        Ok(Self {
            tokenizer,
            max_input_length,
            truncate,
        })
    }

    pub fn max_input_length(&self) -> usize {
        self.max_input_length
    }

    /// Tokenize `inputs` into a single batch, one sequence per input
    #[instrument(skip_all)]
    pub fn encode<S: AsRef<str>>(&self, inputs: &[S]) -> Result<Batch, MultitaskError> {
        if inputs.is_empty() {
            return Err(MultitaskError::Validation(
                "`inputs` cannot be empty".to_string(),
            ));
        }

        let mut input_ids = Vec::new();
        let mut position_ids = Vec::new();
        let mut cumulative_seq_lengths = Vec::with_capacity(inputs.len() + 1);
        cumulative_seq_lengths.push(0);

        let mut max_length = 0;
        let mut cumulative_length = 0;

        for input in inputs {
            let encoding = self.encode_input(input.as_ref())?;
            let length = encoding.len() as u32;

            input_ids.extend(encoding);
            position_ids.extend(0..length);
            cumulative_length += length;
            cumulative_seq_lengths.push(cumulative_length);
            max_length = max(max_length, length);
        }

        Ok(Batch {
            input_ids,
            position_ids,
            cumulative_seq_lengths,
            max_length,
        })
    }

    fn encode_input(&self, input: &str) -> Result<Vec<u32>, MultitaskError> {
        let input_chars = input.chars().count();
        let limit = self.max_input_length * MAX_CHAR_MULTIPLIER;
        if input_chars > limit && !self.truncate {
            return Err(MultitaskError::Validation(format!(
                "`inputs` must have less than {limit} characters. Given: {input_chars}"
            )));
        }

        let encoding = self.tokenizer.encode::<&str>(input, true)?;
        let seq_len = encoding.len();

        if seq_len == 0 {
            return Err(MultitaskError::Validation(
                "`inputs` cannot be empty".to_string(),
            ));
        }
        if seq_len > self.max_input_length {
            return Err(MultitaskError::Validation(format!(
                "`inputs` must have less than {} tokens. Given: {seq_len}",
                self.max_input_length
            )));
        }

        metrics::histogram!("mt_request_input_length").record(seq_len as f64);
        Ok(encoding.get_ids().to_vec())
    }
}
