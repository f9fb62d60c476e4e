//! # Logging helpers

use std::{env, fmt};

use error_stack::Result;
use tracing::Subscriber;
use tracing_subscriber::{prelude::*, registry::LookupSpan, EnvFilter, Layer};

pub type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

#[derive(Debug)]
pub struct ObservabilityInitError;
impl error_stack::Context for ObservabilityInitError {}

impl fmt::Display for ObservabilityInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to initialize observability")
    }
}

/// Initialize the tracing subscriber.
///
/// The log filter is taken from `LOG_LEVEL` if set, then `RUST_LOG`,
/// defaulting to `info`. Set `RUST_LOG_FORMAT=json` for newline-delimited
/// JSON output.
pub fn init_observability() -> Result<(), ObservabilityInitError> {
    if let Ok(level) = env::var("LOG_LEVEL") {
        if env::var("RUST_LOG").is_err() {
            env::set_var("RUST_LOG", level);
        }
    }

    tracing_subscriber::registry().with(vec![stdout()]).init();

    Ok(())
}

fn stdout<S>() -> BoxedLayer<S>
where
    S: Subscriber,
    for<'a> S: LookupSpan<'a>,
{
    let log_env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_fmt = env::var("RUST_LOG_FORMAT")
        .map(|val| val == "json")
        .unwrap_or(false);

    if json_fmt {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .json()
            .with_filter(log_env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .with_target(false)
            .with_filter(log_env_filter)
            .boxed()
    }
}
