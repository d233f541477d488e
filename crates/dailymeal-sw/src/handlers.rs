//! Network-first and cache-first fetch handlers.
//!
//! Neither handler ever fails: every network or cache problem ends in a
//! response the page can consume.

use dailymeal_common::with_timeout;
use dailymeal_net::{Fetcher, NetError, Request, Response};
use http::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheKey, CacheStore};
use crate::WorkerConfig;

// ==================== Fetch Response ====================

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    /// Synthesized 503 for an API request with nothing cached.
    Offline,
    /// Synthesized 404 or network error.
    Fallback,
}

/// Response handed back to the page.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// Status code.
    pub status: u16,

    /// Status text.
    pub status_text: String,

    /// Response headers.
    pub headers: HeaderMap,

    /// Response body.
    pub body: Vec<u8>,

    pub source: ResponseSource,
}

impl FetchResponse {
    /// Create a network error response (status 0, like a failed fetch).
    pub fn network_error() -> Self {
        Self {
            status: 0,
            status_text: "Network Error".to_string(),
            headers: HeaderMap::new(),
            body: Vec::new(),
            source: ResponseSource::Fallback,
        }
    }

    /// Empty 404.
    pub fn not_found() -> Self {
        Self {
            status: 404,
            status_text: "Not Found".to_string(),
            headers: HeaderMap::new(),
            body: Vec::new(),
            source: ResponseSource::Fallback,
        }
    }

    /// `503` JSON body telling the page it is offline.
    pub fn offline(message: &str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Self {
            status: 503,
            status_text: "Service Unavailable".to_string(),
            headers,
            body: json!({ "error": message, "offline": true })
                .to_string()
                .into_bytes(),
            source: ResponseSource::Offline,
        }
    }

    /// Create a response from cache entry.
    pub fn from_cache(entry: &CacheEntry) -> Self {
        Self {
            status: entry.status,
            status_text: status_text(entry.status),
            headers: entry.headers.clone(),
            body: entry.body.clone(),
            source: ResponseSource::Cache,
        }
    }

    /// Pass a live network response through unchanged.
    pub fn from_network(response: &Response) -> Self {
        Self {
            status: response.status.as_u16(),
            status_text: status_text(response.status.as_u16()),
            headers: response.headers.clone(),
            body: response.body.to_vec(),
            source: ResponseSource::Network,
        }
    }

    /// Check if successful (2xx).
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body parsed as JSON.
    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

fn status_text(status: u16) -> String {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("")
        .to_string()
}

/// One network attempt, bounded by `timeout` when set.
pub(crate) async fn fetch_network(
    network: &dyn Fetcher,
    request: Request,
    timeout: Option<Duration>,
) -> Result<Response, NetError> {
    match timeout {
        Some(limit) => with_timeout(limit, || network.fetch(request))
            .await
            .map_err(|_| NetError::Timeout(limit))?,
        None => network.fetch(request).await,
    }
}

// ==================== Handlers ====================

/// The two fetch policies over a shared cache store and network.
///
/// API cache writes run as background tasks owned by the handlers; dropping
/// the last clone aborts any still in flight.
#[derive(Clone)]
pub struct FetchHandlers {
    config: Arc<WorkerConfig>,
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Fetcher>,
    writes: Arc<Mutex<JoinSet<()>>>,
}

impl FetchHandlers {
    pub fn new(
        config: Arc<WorkerConfig>,
        store: Arc<dyn CacheStore>,
        network: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            config,
            store,
            network,
            writes: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    /// Wait for every background cache write started so far.
    pub async fn flush(&self) {
        let mut pending = std::mem::take(&mut *self.writes.lock().await);
        while let Some(joined) = pending.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Cache write task failed");
            }
        }
    }

    /// Store `entry` in the API cache without holding up the response.
    async fn cache_in_background(&self, entry: CacheEntry) {
        let store = self.store.clone();
        let cache_name = self.config.api_cache_name.clone();

        let mut writes = self.writes.lock().await;
        while writes.try_join_next().is_some() {}
        writes.spawn(async move {
            let key = entry.key();
            if let Err(e) = store.put(&cache_name, entry).await {
                warn!(key = %key, error = %e, "Failed to cache API response");
            }
        });
    }

    /// Network first; successful responses refresh the API cache.
    pub async fn network_first(&self, request: Request) -> FetchResponse {
        let key = CacheKey::from_request(&request);

        match fetch_network(
            self.network.as_ref(),
            request.clone(),
            self.config.network_timeout(),
        )
        .await
        {
            Ok(response) => {
                if response.ok() {
                    self.cache_in_background(CacheEntry::from_response(&request, &response))
                        .await;
                }
                FetchResponse::from_network(&response)
            }
            Err(e) => {
                debug!(key = %key, error = %e, "Network failed, trying API cache");
                match self.store.match_in(&self.config.api_cache_name, &key).await {
                    Ok(Some(entry)) => FetchResponse::from_cache(&entry),
                    Ok(None) => FetchResponse::offline(&self.config.offline_message),
                    Err(cache_err) => {
                        warn!(key = %key, error = %cache_err, "API cache lookup failed");
                        FetchResponse::offline(&self.config.offline_message)
                    }
                }
            }
        }
    }

    /// Cache first; network results are returned without being written back.
    pub async fn cache_first(&self, request: Request) -> FetchResponse {
        let key = CacheKey::from_request(&request);

        match self.store.match_any(&key).await {
            Ok(Some(entry)) => return FetchResponse::from_cache(&entry),
            Ok(None) => {}
            Err(e) => warn!(key = %key, error = %e, "Cache lookup failed"),
        }

        let is_navigation = request.is_navigation();
        let origin = request.url.clone();

        match fetch_network(self.network.as_ref(), request, self.config.network_timeout()).await {
            Ok(response) => FetchResponse::from_network(&response),
            Err(e) if is_navigation => {
                debug!(key = %key, error = %e, "Navigation offline, serving shell");
                self.shell(&origin).await
            }
            Err(e) => {
                debug!(key = %key, error = %e, "Sub-resource offline");
                FetchResponse::not_found()
            }
        }
    }

    async fn shell(&self, page_url: &Url) -> FetchResponse {
        let shell_url = match page_url.join(&self.config.root_document) {
            Ok(url) => url,
            Err(_) => return FetchResponse::network_error(),
        };

        match self.store.match_any(&CacheKey::get(&shell_url)).await {
            Ok(Some(entry)) => FetchResponse::from_cache(&entry),
            Ok(None) => FetchResponse::network_error(),
            Err(e) => {
                warn!(url = %shell_url, error = %e, "Shell lookup failed");
                FetchResponse::network_error()
            }
        }
    }
}
