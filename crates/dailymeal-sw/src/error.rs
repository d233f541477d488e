//! Worker error type.

use dailymeal_common::CommonError;
use dailymeal_net::NetError;
use thiserror::Error;

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<NetError> for ServiceWorkerError {
    fn from(err: NetError) -> Self {
        Self::NetworkError(err.to_string())
    }
}

impl From<CommonError> for ServiceWorkerError {
    fn from(err: CommonError) -> Self {
        match err {
            CommonError::Timeout(_) => Self::NetworkError(err.to_string()),
            CommonError::NotFound(what) => Self::NotFound(what),
            other => Self::ConfigError(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ServiceWorkerError {
    fn from(err: std::io::Error) -> Self {
        Self::CacheError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceWorkerError {
    fn from(err: serde_json::Error) -> Self {
        Self::CacheError(err.to_string())
    }
}
