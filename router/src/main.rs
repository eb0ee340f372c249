use anyhow::Result;
use clap::Parser;
use multitask_backend_candle::{
    HeadsConfig, DEFAULT_NUM_CANDIDATES, DEFAULT_N_FEATURES, DEFAULT_PROJECTION_DIM,
};
use multitask_backend_core::DType;
use multitask_core::{MultitaskConfig, SamplingConfig};
use std::path::PathBuf;
use veil::Redact;

/// App Configuration
#[derive(Parser, Redact)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// The name of the model to load.
    /// Can be a MODEL_ID as listed on <https://hf.co/models> like
    /// `FINGU-AI/FinguAI-Chat-v1`.
    /// Or it can be a local directory containing the necessary files
    /// as saved by `save_pretrained(...)` methods of transformers
    #[clap(default_value = "FINGU-AI/FinguAI-Chat-v1", long, env)]
    #[redact(partial)]
    model_id: String,

    /// The actual revision of the model if you're referring to a model
    /// on the hub. You can use a specific commit id or a branch like `refs/pr/2`.
    #[clap(long, env)]
    revision: Option<String>,

    /// The dtype to be forced upon the model.
    #[clap(long, env, value_enum)]
    dtype: Option<DType>,

    /// Path to the persisted vector index of the candidates
    #[clap(default_value = "data/etfs.index", long, env)]
    index_path: PathBuf,

    /// Classification head checkpoint. Randomly initialized when not set
    #[clap(long, env)]
    class_path: Option<PathBuf>,

    /// Selection head checkpoint. Randomly initialized when not set
    #[clap(long, env)]
    select_path: Option<PathBuf>,

    /// Projection checkpoint. Randomly initialized when not set
    #[clap(long, env)]
    projection_path: Option<PathBuf>,

    /// Width of the model hidden state
    #[clap(default_value_t = DEFAULT_N_FEATURES, long, env)]
    n_features: usize,

    /// Number of candidates scored by the selection head
    #[clap(default_value_t = DEFAULT_NUM_CANDIDATES, long, env)]
    num_candidates: usize,

    /// Output width of the projection, must match the index dimension
    #[clap(default_value_t = DEFAULT_PROJECTION_DIM, long, env)]
    projection_dim: usize,

    /// Sample candidates instead of keeping the top ranked ones
    #[clap(long, env)]
    do_sample: bool,

    /// The higher, the more random the sampling
    #[clap(default_value = "0", long, env)]
    temperature: f32,

    #[clap(default_value = "0.2", long, env)]
    top_p: f32,

    #[clap(default_value = "50", long, env)]
    top_k: usize,

    /// Minimum number of ids returned by `select`
    #[clap(default_value = "3", long, env)]
    min_selected: usize,

    /// Maximum number of ids returned by `select`
    #[clap(default_value = "8", long, env)]
    max_selected: usize,

    /// RNG seed for the head initialization and the selection draws
    #[clap(long, env)]
    seed: Option<u64>,

    /// Text to run through the model
    #[clap(default_value = "hello yann lecun", long, env)]
    text: String,

    /// Optionally limit the number of tokens per input.
    /// Defaults to `max_position_embeddings` of the model configuration
    #[clap(long, env)]
    max_input_length: Option<usize>,

    /// Automatically truncate inputs that are longer than the maximum supported size
    #[clap(long, env)]
    auto_truncate: bool,

    /// Your Hugging Face Hub token
    #[clap(long, env)]
    #[redact(partial)]
    hf_token: Option<String>,

    /// The location of the huggingface hub cache.
    /// Used to override the location if you want to provide a mounted disk for instance
    #[clap(long, env)]
    huggingface_hub_cache: Option<String>,

    /// Outputs the logs in JSON format (useful for telemetry)
    #[clap(long, env)]
    json_output: bool,

    // Whether or not to include the log trace through spans
    #[clap(long, env)]
    disable_spans: bool,
}

impl Args {
    fn heads_config(&self) -> HeadsConfig {
        HeadsConfig {
            n_features: self.n_features,
            num_candidates: self.num_candidates,
            projection_dim: self.projection_dim,
            class_path: self.class_path.clone(),
            select_path: self.select_path.clone(),
            projection_path: self.projection_path.clone(),
            seed: self.seed,
        }
    }

    fn multitask_config(&self) -> MultitaskConfig {
        MultitaskConfig {
            sampling: SamplingConfig {
                do_sample: self.do_sample,
                temperature: self.temperature,
                top_p: self.top_p,
                top_k: self.top_k,
            },
            min_selected: self.min_selected,
            max_selected: self.max_selected,
            ..Default::default()
        }
    }
}


fn main() -> Result<()> {
    // Pattern match configuration
    let args: Args = Args::parse();

    multitask_router::init_logging(args.json_output, args.disable_spans);

    tracing::info!("{args:?}");

    let heads = args.heads_config();
    let config = args.multitask_config();

    let report = multitask_router::run(
        args.model_id,
        args.revision,
        args.dtype,
        heads,
        config,
        args.index_path,
        args.text,
        args.max_input_length,
        args.auto_truncate,
        args.hf_token,
        args.huggingface_hub_cache,
        args.seed,
    )?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
