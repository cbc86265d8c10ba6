//! Process-level error types.

use thiserror::Error;

/// Configuration could not be resolved from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}
