//! Process-wide `tracing` subscriber setup.
//!
//! Both binaries log to stderr so stdout stays free for scripting.

use std::io;

use thiserror::Error;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The configured level is not a valid filter directive.
    #[error("invalid log filter {filter:?}: {message}")]
    Filter {
        /// Rejected filter text.
        filter: String,
        /// Parser message.
        message: String,
    },
    /// A global subscriber is already installed.
    #[error("failed to install log subscriber: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}

/// Builds the filter: `RUST_LOG` when set, otherwise `level`.
///
/// Chatty HTTP internals are capped at `warn` either way.
///
/// # Errors
///
/// Returns [`LoggingError::Filter`] when `level` cannot be parsed.
pub fn filter(level: &str) -> Result<EnvFilter, LoggingError> {
    let base = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|err| LoggingError::Filter {
            filter: level.to_owned(),
            message: err.to_string(),
        })?;
    Ok(["hyper=warn", "reqwest=warn"]
        .iter()
        .filter_map(|directive| directive.parse::<Directive>().ok())
        .fold(base, EnvFilter::add_directive))
}

/// Installs the global subscriber, as JSON lines when `json` is set.
///
/// # Errors
///
/// Returns [`LoggingError`] when the filter is invalid or a subscriber is
/// already installed.
pub fn init(level: &str, json: bool) -> Result<(), LoggingError> {
    let env_filter = filter(level)?;
    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(io::stderr))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_writer(io::stderr))
            .try_init()?;
    }
    Ok(())
}
