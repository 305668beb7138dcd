//! Structured logging setup
//!
//! Provides JSON-formatted and human-readable logging with optional file
//! output. `RUST_LOG` takes precedence over the configured level.
//!
//! Lifecycle events use dotted field names so they can be filtered in JSON
//! output: `session.id`, `scope.id`, `order.job_id`, `fanout.*` and `sweep.*`.

use crate::config::LoggingConfig;
use anyhow::Result;
use std::fs::OpenOptions;
use std::sync::Arc;
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::Registry;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Subscriber used while configuration is loaded, before `init_logging`
///
/// Writes to stderr so command output on stdout stays machine-readable.
/// `verbose` lowers the fallback level from `info` to `debug`.
///
/// # Examples
///
/// ```
/// use scopekeeper::logging::bootstrap_subscriber;
///
/// tracing::subscriber::with_default(bootstrap_subscriber(false), || {
///     tracing::warn!("emitted before configuration is known");
/// });
/// ```
pub fn bootstrap_subscriber(verbose: bool) -> impl Subscriber + Send + Sync + 'static {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(output_layer(false, true, std::io::stderr))
        .with(filter)
}

/// Initialize the global tracing subscriber from configuration.
///
/// Output goes to stdout and, when `file_path` is set, is appended to that
/// file as well.
///
/// # Errors
///
/// Returns an error if the level is not a valid filter directive, the log
/// file cannot be opened, or a global subscriber is already installed.
///
/// # Examples
///
/// ```no_run
/// use scopekeeper::config::LoggingConfig;
/// use scopekeeper::logging::init_logging;
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     json_format: true,
///     file_path: None,
/// };
///
/// init_logging(&config).unwrap();
/// ```
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(&config.level)?;
    let layers = output_layers(config)?;

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()?;
    Ok(())
}

fn output_layers(config: &LoggingConfig) -> Result<Vec<BoxedLayer>> {
    let mut layers = vec![output_layer(config.json_format, true, std::io::stdout)];

    if let Some(file_path) = &config.file_path {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        layers.push(output_layer(config.json_format, false, Arc::new(file)));
    }

    Ok(layers)
}

fn output_layer<W>(json: bool, ansi: bool, writer: W) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_ansi(ansi)
        .with_target(true)
        .with_writer(writer);

    if json {
        layer
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .boxed()
    } else {
        layer.with_thread_ids(true).boxed()
    }
}

/// Filter from `RUST_LOG`, falling back to `level`
pub(crate) fn build_filter(level: &str) -> Result<EnvFilter> {
    Ok(EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?)
}
