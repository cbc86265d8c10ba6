//! Configuration resolved from environment variables.
//!
//! `.env` is loaded by the binary before [`Config::from_env`] runs, so values
//! there behave exactly like exported variables.

mod environment;
pub(crate) mod helpers;

pub use environment::{EnvironmentConfig, OutputMode};

use crate::error::ConfigError;

/// Complete process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub environment: EnvironmentConfig,
}

impl Config {
    /// Resolve every setting from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            environment: EnvironmentConfig::resolve()?,
        })
    }
}
