use crate::index::VectorIndex;
use crate::sampling::{select_scores, SamplingConfig, Selection};
use crate::MultitaskError;
use multitask_backend_core::{Backend, Batch, Embeddings, Head, Predictions};
use rand::Rng;
use serde::Deserialize;
use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Instant;
use tracing::instrument;

pub const DEFAULT_NEIGHBOURS: usize = 50;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MultitaskConfig {
    pub sampling: SamplingConfig,
    /// Bounds (inclusive) of the number of ids returned by `select`
    pub min_selected: usize,
    pub max_selected: usize,
    /// Neighbours retrieved from the index before the selection cut
    pub neighbours: usize,
}

impl Default for MultitaskConfig {
    fn default() -> Self {
        Self {
            sampling: SamplingConfig::default(),
            min_selected: 3,
            max_selected: 8,
            neighbours: DEFAULT_NEIGHBOURS,
        }
    }
}

impl MultitaskConfig {
    pub fn selection_range(&self) -> RangeInclusive<usize> {
        self.min_selected..=self.max_selected
    }
}

fn record_failure(err: impl Into<MultitaskError>) -> MultitaskError {
    let err = err.into();
    metrics::counter!("mt_request_failure", "err" => err.error_type()).increment(1);
    tracing::error!("{err}");
    err
}

/// Language model body with classification, selection and retrieval heads
pub struct MultitaskLM<B: Backend> {
    backend: B,
    index: VectorIndex,
    config: MultitaskConfig,
}

impl<B: Backend> MultitaskLM<B> {
    pub fn new(
        backend: B,
        index_path: &Path,
        config: MultitaskConfig,
    ) -> Result<Self, MultitaskError> {
        let index = VectorIndex::load(index_path)?;
        Self::with_index(backend, index, config)
    }

    pub fn with_index(
        backend: B,
        index: VectorIndex,
        config: MultitaskConfig,
    ) -> Result<Self, MultitaskError> {
        if config.min_selected > config.max_selected {
            return Err(MultitaskError::Validation(format!(
                "`min_selected` ({}) must be lower or equal to `max_selected` ({})",
                config.min_selected, config.max_selected
            )));
        }
        backend.health()?;

        let model = Self {
            backend,
            index,
            config,
        };
        model.check_index();
        Ok(model)
    }

    /// Replace the vector index with the one persisted at `path`
    #[instrument(skip(self))]
    pub fn init_index(&mut self, path: &Path) -> Result<(), MultitaskError> {
        self.index = VectorIndex::load(path).map_err(record_failure)?;
        self.check_index();
        Ok(())
    }

    fn check_index(&self) {
        let projection_dim = self.backend.output_size(Head::Projection);
        if projection_dim != self.index.dimension() {
            tracing::warn!(
                "Projection width {projection_dim} does not match index dimension {}: `select` will fail",
                self.index.dimension()
            );
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn config(&self) -> &MultitaskConfig {
        &self.config
    }

    #[instrument(skip_all)]
    pub fn forward(&self, batch: Batch) -> Result<B::State, MultitaskError> {
        let start = Instant::now();
        let batch_size = batch.len();

        let state = self.backend.forward(batch).map_err(record_failure)?;

        metrics::histogram!("mt_forward_duration").record(start.elapsed().as_secs_f64());
        tracing::debug!("Forward pass on {batch_size} inputs in {:?}", start.elapsed());
        Ok(state)
    }

    /// Mean pooled embeddings, normalized by the norm of the whole batch
    #[instrument(skip_all)]
    pub fn encode(&self, state: &B::State) -> Result<Embeddings, MultitaskError> {
        let embeddings = self.backend.embed(state).map_err(record_failure)?;
        tracing::debug!(
            "Embedding shape: ({}, {})",
            embeddings.len(),
            embeddings.first().map(Vec::len).unwrap_or_default()
        );
        Ok(embeddings)
    }

    /// Two logits per input
    #[instrument(skip_all)]
    pub fn classify(&self, state: &B::State) -> Result<Predictions, MultitaskError> {
        self.backend
            .predict(state, Head::Classification)
            .map_err(record_failure)
    }

    /// Ids of the index vectors closest to the projected embedding of the first input.
    ///
    /// The number of ids is drawn uniformly from the configured selection range.
    #[instrument(skip_all)]
    pub fn select<R: Rng + ?Sized>(
        &self,
        state: &B::State,
        rng: &mut R,
    ) -> Result<Vec<usize>, MultitaskError> {
        let projected = self
            .backend
            .predict(state, Head::Projection)
            .map_err(record_failure)?;
        let query = first_row(projected).map_err(record_failure)?;

        if query.len() != self.index.dimension() {
            return Err(record_failure(MultitaskError::DimensionMismatch {
                expected: self.index.dimension(),
                actual: query.len(),
            }));
        }

        let hits = self
            .index
            .search(&query, self.config.neighbours)
            .map_err(record_failure)?;
        let n = rng.gen_range(self.config.selection_range());

        let ids: Vec<usize> = hits.into_iter().take(n).map(|hit| hit.id).collect();
        metrics::histogram!("mt_select_count").record(ids.len() as f64);
        Ok(ids)
    }

    /// Shortlist of candidates from the selection head logits of the first input
    #[instrument(skip_all)]
    pub fn rank<R: Rng + ?Sized>(
        &self,
        state: &B::State,
        standardize: bool,
        rng: &mut R,
    ) -> Result<Selection, MultitaskError> {
        let scores = self
            .backend
            .predict(state, Head::Selection)
            .map_err(record_failure)?;
        let mut heatmap = first_row(scores).map_err(record_failure)?;

        select_scores(&mut heatmap, &self.config.sampling, standardize, rng).map_err(record_failure)
    }

    pub fn session(&self) -> Session<'_, B> {
        Session {
            model: self,
            previous: None,
        }
    }
}

fn first_row(rows: Vec<Vec<f32>>) -> Result<Vec<f32>, MultitaskError> {
    rows.into_iter()
        .next()
        .ok_or_else(|| MultitaskError::Validation("batch is empty".to_string()))
}

/// Where a `Session` operation takes its hidden state from
#[derive(Debug, Clone)]
pub enum Input {
    /// Run a new forward pass and keep its state
    Batch(Batch),
    /// Reuse the state of the last forward pass
    Previous,
}

impl From<Batch> for Input {
    fn from(batch: Batch) -> Self {
        Input::Batch(batch)
    }
}

/// Keeps the hidden state of the last forward pass so it can be reused across heads
pub struct Session<'a, B: Backend> {
    model: &'a MultitaskLM<B>,
    previous: Option<B::State>,
}

impl<'a, B: Backend> Session<'a, B> {
    fn state(&mut self, input: Input) -> Result<&B::State, MultitaskError> {
        match input {
            Input::Batch(batch) => {
                let state = self.model.forward(batch)?;
                Ok(self.previous.insert(state))
            }
            Input::Previous => self
                .previous
                .as_ref()
                .ok_or_else(|| record_failure(MultitaskError::NoPreviousForward)),
        }
    }

    pub fn has_previous(&self) -> bool {
        self.previous.is_some()
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }

    pub fn forward(&mut self, batch: Batch) -> Result<&B::State, MultitaskError> {
        self.state(Input::Batch(batch))
    }

    pub fn encode(&mut self, input: Input) -> Result<Embeddings, MultitaskError> {
        let model = self.model;
        model.encode(self.state(input)?)
    }

    pub fn classify(&mut self, input: Input) -> Result<Predictions, MultitaskError> {
        let model = self.model;
        model.classify(self.state(input)?)
    }

    pub fn select<R: Rng + ?Sized>(
        &mut self,
        input: Input,
        rng: &mut R,
    ) -> Result<Vec<usize>, MultitaskError> {
        let model = self.model;
        model.select(self.state(input)?, rng)
    }

    pub fn rank<R: Rng + ?Sized>(
        &mut self,
        input: Input,
        standardize: bool,
        rng: &mut R,
    ) -> Result<Selection, MultitaskError> {
        let model = self.model;
        model.rank(self.state(input)?, standardize, rng)
    }
}
