//! Worker configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::ServiceWorkerError;

/// Immutable configuration handed to the router, handlers, and lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Generation-tagged name of the static asset cache.
    pub static_cache_name: String,

    /// Generation-tagged name of the API response cache.
    pub api_cache_name: String,

    /// Paths cached at install time, relative to the worker scope.
    pub static_assets: Vec<String>,

    /// Requests under this prefix go network-first.
    pub api_prefix: String,

    /// Uploaded images (meal photos) also go network-first.
    pub upload_prefix: String,

    /// Any path containing this marker is never intercepted.
    pub realtime_marker: String,

    /// Shell served to navigations when both cache and network miss.
    pub root_document: String,

    /// Message placed in the synthesized offline response.
    pub offline_message: String,

    /// Upper bound on a single network attempt, in seconds.
    pub network_timeout_secs: Option<u64>,

    /// Activate as soon as install finishes, even if an older worker is active.
    pub skip_waiting: bool,

    /// Take control of already-open pages on activation.
    pub claim_clients: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::versioned("dailymeal", "v1")
    }
}

impl WorkerConfig {
    /// Default configuration with both cache names tagged by `version`.
    pub fn versioned(prefix: &str, version: &str) -> Self {
        Self {
            static_cache_name: format!("{prefix}-static-{version}"),
            api_cache_name: format!("{prefix}-api-{version}"),
            static_assets: vec![
                "/".to_string(),
                "/manifest.json".to_string(),
                "/icons/icon-192x192.png".to_string(),
                "/icons/icon-512x512.png".to_string(),
            ],
            api_prefix: "/api/".to_string(),
            upload_prefix: "/uploads/".to_string(),
            realtime_marker: "/socket.io/".to_string(),
            root_document: "/".to_string(),
            offline_message: "You are offline. Please check your network connection.".to_string(),
            network_timeout_secs: None,
            skip_waiting: true,
            claim_clients: true,
        }
    }

    /// Load from a JSON file; missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ServiceWorkerError> {
        let config: Self = dailymeal_common::load_json(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the router or lifecycle cannot work with.
    pub fn validate(&self) -> Result<(), ServiceWorkerError> {
        if self.static_cache_name.is_empty() || self.api_cache_name.is_empty() {
            return Err(ServiceWorkerError::ConfigError(
                "cache names must not be empty".to_string(),
            ));
        }
        if self.static_cache_name == self.api_cache_name {
            return Err(ServiceWorkerError::ConfigError(format!(
                "static and API caches share the name '{}'",
                self.static_cache_name
            )));
        }
        for (field, value) in [
            ("api_prefix", &self.api_prefix),
            ("upload_prefix", &self.upload_prefix),
            ("root_document", &self.root_document),
        ] {
            if !value.starts_with('/') {
                return Err(ServiceWorkerError::ConfigError(format!(
                    "{field} must start with '/', got '{value}'"
                )));
            }
        }
        if self.network_timeout_secs == Some(0) {
            return Err(ServiceWorkerError::ConfigError(
                "network_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.realtime_marker.is_empty() {
            return Err(ServiceWorkerError::ConfigError(
                "realtime_marker must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Per-attempt network timeout, if configured.
    pub fn network_timeout(&self) -> Option<Duration> {
        self.network_timeout_secs.map(Duration::from_secs)
    }

    /// Whether `name` is one of the two live cache generations.
    pub fn is_current_cache(&self, name: &str) -> bool {
        name == self.static_cache_name || name == self.api_cache_name
    }
}
