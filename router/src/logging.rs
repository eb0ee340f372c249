use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const DEFAULT_LOG_LEVEL: &str = "info";

/// Install the global subscriber. Verbosity comes from `LOG_LEVEL` (`info` when unset or invalid).
///
/// JSON lines carry the active span and its parents unless `disable_spans` is set.
pub fn init_logging(json_output: bool, disable_spans: bool) {
    let with_spans = !disable_spans;
    let console = tracing_subscriber::fmt::layer()
        .with_file(true)
        .with_line_number(true);

    let console = if json_output {
        console
            .json()
            .flatten_event(true)
            .with_current_span(with_spans)
            .with_span_list(with_spans)
            .boxed()
    } else {
        console.boxed()
    };

    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .init();
}
