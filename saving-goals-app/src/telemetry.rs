//! Structured logging setup.

use crate::config::LogConfig;
use thiserror::Error;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Logging could not be initialised.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The configured filter directive is malformed.
    #[error("invalid log filter '{directive}': {source}")]
    Filter {
        /// The rejected directive
        directive: String,
        /// Parser error
        source: ParseError,
    },

    /// A global subscriber was already installed.
    #[error(transparent)]
    Init(#[from] TryInitError),
}

/// Builds the filter: `RUST_LOG` when set, the configured level otherwise.
pub fn env_filter(config: &LogConfig) -> Result<EnvFilter, TelemetryError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level).map_err(|source| TelemetryError::Filter {
            directive: config.level.clone(),
            source,
        }),
    }
}

/// Installs the global subscriber.
pub fn init(config: &LogConfig) -> Result<(), TelemetryError> {
    let filter = env_filter(config)?;

    let format = if config.json {
        fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(format)
        .try_init()?;
    Ok(())
}
