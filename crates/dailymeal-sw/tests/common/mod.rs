//! Shared fixtures for worker integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use dailymeal_net::{Fetcher, NetError, Request, Response};
use dailymeal_sw::{
    CacheEntry, CacheKey, CacheStore, MemoryCacheStore, ServiceWorker, ServiceWorkerError,
    WorkerConfig,
};
use http::{header, HeaderName, HeaderValue, StatusCode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

pub const ORIGIN: &str = "https://dailymeal.app/";
pub const SCRIPT: &str = "https://dailymeal.app/sw.js";

pub fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

/// Scripted network: fixed routes, an online switch, and a call log.
#[derive(Default)]
pub struct MockNetwork {
    routes: Mutex<HashMap<String, (u16, &'static str, Vec<u8>)>>,
    extra_headers: Mutex<HashMap<String, Vec<(HeaderName, HeaderValue)>>>,
    offline: AtomicBool,
    delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<String>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Network that serves the default install manifest.
    pub fn with_manifest() -> Arc<Self> {
        let network = Self::new();
        network.route("/", 200, "text/html", b"<html>DailyMeal</html>");
        network.route("/manifest.json", 200, "application/json", br#"{"name":"DailyMeal"}"#);
        network.route("/icons/icon-192x192.png", 200, "image/png", b"png192");
        network.route("/icons/icon-512x512.png", 200, "image/png", b"png512");
        network
    }

    pub fn route(&self, path: &str, status: u16, content_type: &'static str, body: &[u8]) {
        self.routes
            .lock()
            .unwrap()
            .insert(url(path).to_string(), (status, content_type, body.to_vec()));
    }

    /// Append a header to every response for `path`, keeping earlier values.
    pub fn append_header(&self, path: &str, name: HeaderName, value: HeaderValue) {
        self.extra_headers
            .lock()
            .unwrap()
            .entry(url(path).to_string())
            .or_default()
            .push((name, value));
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Fetcher for MockNetwork {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{} {}", request.method, request.url));

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline);
        }

        let route = self.routes.lock().unwrap().get(request.url.as_str()).cloned();
        let extra = self
            .extra_headers
            .lock()
            .unwrap()
            .get(request.url.as_str())
            .cloned()
            .unwrap_or_default();
        let mut response = match route {
            Some((status, content_type, body)) => Response::new(
                request.url,
                StatusCode::from_u16(status).unwrap(),
                body,
            )
            .with_header(header::CONTENT_TYPE, HeaderValue::from_static(content_type)),
            None => Response::new(request.url, StatusCode::NOT_FOUND, Vec::new()),
        };
        for (name, value) in extra {
            response.headers.append(name, value);
        }
        Ok(response)
    }
}

/// Store whose writes always fail; reads go to an inner memory store.
#[derive(Default)]
pub struct ReadOnlyStore {
    pub inner: MemoryCacheStore,
}

#[async_trait]
impl CacheStore for ReadOnlyStore {
    async fn open(&self, name: &str) -> Result<(), ServiceWorkerError> {
        self.inner.open(name).await
    }

    async fn put(&self, _name: &str, _entry: CacheEntry) -> Result<(), ServiceWorkerError> {
        Err(ServiceWorkerError::CacheError("quota exceeded".to_string()))
    }

    async fn put_all(
        &self,
        _name: &str,
        _entries: Vec<CacheEntry>,
    ) -> Result<(), ServiceWorkerError> {
        Err(ServiceWorkerError::CacheError("quota exceeded".to_string()))
    }

    async fn match_in(
        &self,
        name: &str,
        key: &CacheKey,
    ) -> Result<Option<CacheEntry>, ServiceWorkerError> {
        self.inner.match_in(name, key).await
    }

    async fn match_any(&self, key: &CacheKey) -> Result<Option<CacheEntry>, ServiceWorkerError> {
        self.inner.match_any(key).await
    }

    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError> {
        self.inner.keys().await
    }

    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        self.inner.delete(name).await
    }

    async fn entry_count(&self, name: &str) -> Result<Option<usize>, ServiceWorkerError> {
        self.inner.entry_count(name).await
    }
}

/// Store whose writes never finish; reads go to an inner memory store.
#[derive(Default)]
pub struct StalledStore {
    pub inner: MemoryCacheStore,
}

#[async_trait]
impl CacheStore for StalledStore {
    async fn open(&self, name: &str) -> Result<(), ServiceWorkerError> {
        self.inner.open(name).await
    }

    async fn put(&self, _name: &str, _entry: CacheEntry) -> Result<(), ServiceWorkerError> {
        std::future::pending().await
    }

    async fn put_all(
        &self,
        name: &str,
        entries: Vec<CacheEntry>,
    ) -> Result<(), ServiceWorkerError> {
        self.inner.put_all(name, entries).await
    }

    async fn match_in(
        &self,
        name: &str,
        key: &CacheKey,
    ) -> Result<Option<CacheEntry>, ServiceWorkerError> {
        self.inner.match_in(name, key).await
    }

    async fn match_any(&self, key: &CacheKey) -> Result<Option<CacheEntry>, ServiceWorkerError> {
        self.inner.match_any(key).await
    }

    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError> {
        self.inner.keys().await
    }

    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        self.inner.delete(name).await
    }

    async fn entry_count(&self, name: &str) -> Result<Option<usize>, ServiceWorkerError> {
        self.inner.entry_count(name).await
    }
}

pub fn worker(
    config: WorkerConfig,
    store: Arc<dyn CacheStore>,
    network: Arc<MockNetwork>,
) -> ServiceWorker {
    ServiceWorker::new(Url::parse(ORIGIN).unwrap(), config, store, network)
}

/// Worker that has run install and activate against `network`.
pub async fn active_worker(
    store: Arc<dyn CacheStore>,
    network: Arc<MockNetwork>,
) -> ServiceWorker {
    let worker = worker(WorkerConfig::default(), store, network);
    worker.install().await.unwrap();
    worker.activate().await.unwrap();
    worker
}
