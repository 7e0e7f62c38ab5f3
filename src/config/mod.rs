//! Configuration management for fetchengine
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use fetchengine::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Following up to {} redirects", config.http.max_redirects);
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `FETCHENGINE__<section>__<key>`
//!
//! Examples:
//! - `FETCHENGINE__HTTP__USER_AGENT=feeds-sync/2.0`
//! - `FETCHENGINE__RETRY__ENABLED=true`
//! - `FETCHENGINE__UPLOAD__CHUNK_SIZE=1MB`
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/fetchengine.toml`.
//! This can be overridden using the `FETCHENGINE_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

pub use crate::units::ByteSize;
pub use models::{Config, HistoryConfig, HttpConfig, RetryConfig, TelemetryConfig, UploadConfig};
pub use validation::ValidationError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// Configuration is loaded with the following priority (highest to lowest):
    /// 1. Environment variables (`FETCHENGINE__*`)
    /// 2. TOML file (default: `config/fetchengine.toml`)
    /// 3. Default values
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file is malformed or a value
    /// fails validation.
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }
}
