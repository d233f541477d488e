//! # DailyMeal Common
//!
//! Shared error type, logging setup, config loading, and timeout helpers
//! used across the DailyMeal crates.

use std::time::Duration;
use thiserror::Error;

pub mod config;
pub mod logging;
pub mod timeout;

pub use config::load_json;
pub use logging::{init_logging, LogConfig, LogFormat};
pub use timeout::with_timeout;

/// Unified error type for shared utilities.
#[derive(Error, Debug)]
pub enum CommonError {
    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),
}

impl CommonError {
    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Result type alias for shared utilities.
pub type Result<T> = std::result::Result<T, CommonError>;
