//! JSON configuration loading.

use serde::de::DeserializeOwned;
use std::path::Path;
use tracing::debug;

use crate::{CommonError, Result};

/// Load a JSON document from `path` into `T`.
pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(CommonError::NotFound(path.display().to_string()));
    }

    let raw = std::fs::read_to_string(path)?;
    let value = serde_json::from_str(&raw).map_err(|e| {
        CommonError::config_with_source(format!("invalid JSON in {}", path.display()), e)
    })?;

    debug!(path = %path.display(), "Loaded config");
    Ok(value)
}
