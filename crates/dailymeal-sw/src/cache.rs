//! Cache stores.
//!
//! Two generations are live at any time (static assets and API responses).
//! Entries are keyed by method + URL and replaced wholesale on every write.
//!
//! ```text
//! CacheStore (trait)
//!     ├── MemoryCacheStore ──── CacheStorage ──── Cache ──── CacheKey → CacheEntry
//!     └── PersistentCacheStore (memory + JSON snapshot on disk)
//! ```

use async_trait::async_trait;
use dailymeal_net::{Request, Response};
use hashbrown::HashMap;
use http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace};
use url::Url;

use crate::ServiceWorkerError;

// ==================== Keys & Entries ====================

/// Cache key: request method plus full URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub method: String,
    pub url: String,
}

impl CacheKey {
    pub fn new(method: &Method, url: &Url) -> Self {
        Self {
            method: method.as_str().to_string(),
            url: url.as_str().to_string(),
        }
    }

    /// Key for a plain GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }

    pub fn from_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A cached request/response pair, frozen at write time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers, repeated names included.
    #[serde(with = "header_pairs")]
    pub headers: HeaderMap,

    /// Response body.
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Capture `response` as the entry for `request`.
    pub fn from_response(request: &Request, response: &Response) -> Self {
        Self {
            url: request.url.as_str().to_string(),
            method: request.method.as_str().to_string(),
            status: response.status.as_u16(),
            headers: response.headers.clone(),
            body: response.body.to_vec(),
            cached_at: now_millis(),
        }
    }

    pub fn key(&self) -> CacheKey {
        CacheKey {
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

mod base64_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Headers as an ordered list of `[name, value]` pairs. Values that are not
/// visible ASCII are kept as raw byte arrays.
mod header_pairs {
    use http::{HeaderMap, HeaderName, HeaderValue};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Raw(Vec<u8>),
    }

    pub fn serialize<S: Serializer>(headers: &HeaderMap, serializer: S) -> Result<S::Ok, S::Error> {
        let pairs: Vec<(&str, Repr)> = headers
            .iter()
            .map(|(name, value)| {
                let repr = match value.to_str() {
                    Ok(text) => Repr::Text(text.to_string()),
                    Err(_) => Repr::Raw(value.as_bytes().to_vec()),
                };
                (name.as_str(), repr)
            })
            .collect();
        pairs.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<HeaderMap, D::Error> {
        let pairs = Vec::<(String, Repr)>::deserialize(deserializer)?;
        let mut headers = HeaderMap::with_capacity(pairs.len());
        for (name, repr) in pairs {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(D::Error::custom)?;
            let value = match repr {
                Repr::Text(text) => HeaderValue::from_str(&text),
                Repr::Raw(raw) => HeaderValue::from_bytes(&raw),
            }
            .map_err(D::Error::custom)?;
            headers.append(name, value);
        }
        Ok(headers)
    }
}

// ==================== Cache ====================

/// A named cache.
#[derive(Debug, Default, Clone)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    entries: HashMap<CacheKey, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request.
    pub fn match_request(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Store an entry, replacing any previous entry for the same key.
    pub fn put(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.key(), entry);
    }

    /// Delete entry.
    pub fn delete(&mut self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// All keys.
    pub fn keys(&self) -> Vec<&CacheKey> {
        self.entries.keys().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Cache Storage ====================

/// All named caches, in creation order.
#[derive(Debug, Default, Clone)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
    order: Vec<String>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cache (creates if doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        if !self.caches.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Get a cache without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Check if cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a cache.
    pub fn delete(&mut self, name: &str) -> bool {
        self.order.retain(|n| n != name);
        self.caches.remove(name).is_some()
    }

    /// Cache names in creation order.
    pub fn keys(&self) -> Vec<&str> {
        self.order.iter().map(|s| s.as_str()).collect()
    }

    /// Match across all caches, oldest cache first.
    pub fn match_request(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.order
            .iter()
            .filter_map(|name| self.caches.get(name))
            .find_map(|cache| cache.match_request(key))
    }

    fn to_snapshot(&self) -> StorageSnapshot {
        StorageSnapshot {
            caches: self
                .order
                .iter()
                .filter_map(|name| self.caches.get(name))
                .map(|cache| CacheSnapshot {
                    name: cache.name.clone(),
                    entries: cache.entries.values().cloned().collect(),
                })
                .collect(),
        }
    }

    fn from_snapshot(snapshot: StorageSnapshot) -> Self {
        let mut storage = Self::new();
        for cache in snapshot.caches {
            let target = storage.open(&cache.name);
            for entry in cache.entries {
                target.put(entry);
            }
        }
        storage
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StorageSnapshot {
    caches: Vec<CacheSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheSnapshot {
    name: String,
    entries: Vec<CacheEntry>,
}

// ==================== Store Trait ====================

/// Named request → response stores shared by every in-flight fetch.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Create `name` if it does not exist.
    async fn open(&self, name: &str) -> Result<(), ServiceWorkerError>;

    /// Write one entry into `name`, creating the cache if needed.
    async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), ServiceWorkerError>;

    /// Write all entries into `name` or none of them.
    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>)
        -> Result<(), ServiceWorkerError>;

    /// Look up `key` in one cache.
    async fn match_in(
        &self,
        name: &str,
        key: &CacheKey,
    ) -> Result<Option<CacheEntry>, ServiceWorkerError>;

    /// Look up `key` in every cache.
    async fn match_any(&self, key: &CacheKey) -> Result<Option<CacheEntry>, ServiceWorkerError>;

    /// All cache names.
    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError>;

    /// Delete a whole cache; `false` if it did not exist.
    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError>;

    /// Number of entries in `name`, `None` if the cache does not exist.
    async fn entry_count(&self, name: &str) -> Result<Option<usize>, ServiceWorkerError>;
}

// ==================== Memory Store ====================

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    storage: RwLock<CacheStorage>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_storage(storage: CacheStorage) -> Self {
        Self {
            storage: RwLock::new(storage),
        }
    }

    /// Copy of the current contents.
    pub async fn storage(&self) -> CacheStorage {
        self.storage.read().await.clone()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn open(&self, name: &str) -> Result<(), ServiceWorkerError> {
        self.storage.write().await.open(name);
        Ok(())
    }

    async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), ServiceWorkerError> {
        trace!(cache = %name, key = %entry.key(), "Cache put");
        self.storage.write().await.open(name).put(entry);
        Ok(())
    }

    async fn put_all(
        &self,
        name: &str,
        entries: Vec<CacheEntry>,
    ) -> Result<(), ServiceWorkerError> {
        let mut storage = self.storage.write().await;
        let cache = storage.open(name);
        for entry in entries {
            cache.put(entry);
        }
        Ok(())
    }

    async fn match_in(
        &self,
        name: &str,
        key: &CacheKey,
    ) -> Result<Option<CacheEntry>, ServiceWorkerError> {
        let storage = self.storage.read().await;
        Ok(storage
            .get(name)
            .and_then(|cache| cache.match_request(key))
            .cloned())
    }

    async fn match_any(&self, key: &CacheKey) -> Result<Option<CacheEntry>, ServiceWorkerError> {
        Ok(self.storage.read().await.match_request(key).cloned())
    }

    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError> {
        let storage = self.storage.read().await;
        Ok(storage.keys().into_iter().map(str::to_string).collect())
    }

    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        Ok(self.storage.write().await.delete(name))
    }

    async fn entry_count(&self, name: &str) -> Result<Option<usize>, ServiceWorkerError> {
        Ok(self.storage.read().await.get(name).map(Cache::len))
    }
}

// ==================== Persistent Store ====================

/// Memory store mirrored to a JSON snapshot after every mutation, so caches
/// survive worker restarts.
///
/// Mutations are serialized. Each one is applied to a copy of the storage,
/// written to disk, and only then made visible, so memory never holds
/// anything the snapshot lacks.
#[derive(Debug)]
pub struct PersistentCacheStore {
    inner: MemoryCacheStore,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl PersistentCacheStore {
    /// Open the snapshot at `path`, starting empty if it does not exist yet.
    pub async fn open_at(path: impl AsRef<Path>) -> Result<Self, ServiceWorkerError> {
        let path = path.as_ref().to_path_buf();

        let storage = match tokio::fs::read(&path).await {
            Ok(raw) => {
                let snapshot: StorageSnapshot = serde_json::from_slice(&raw)?;
                debug!(path = %path.display(), caches = snapshot.caches.len(), "Loaded cache snapshot");
                CacheStorage::from_snapshot(snapshot)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CacheStorage::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            inner: MemoryCacheStore::with_storage(storage),
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `mutate` to a copy of the storage, persist the copy, then swap
    /// it in. On error the visible contents are unchanged.
    async fn commit<R>(
        &self,
        mutate: impl FnOnce(&mut CacheStorage) -> R,
    ) -> Result<R, ServiceWorkerError> {
        let _guard = self.write_lock.lock().await;

        let mut next = self.inner.storage.read().await.clone();
        let result = mutate(&mut next);
        self.write_snapshot(&next).await?;
        *self.inner.storage.write().await = next;

        Ok(result)
    }

    async fn write_snapshot(&self, storage: &CacheStorage) -> Result<(), ServiceWorkerError> {
        let raw = serde_json::to_vec(&storage.to_snapshot())?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&dir).await?;

        // Unique temp file in the same directory, then an atomic rename over
        // the snapshot.
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&raw)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| ServiceWorkerError::CacheError(format!("snapshot writer failed: {e}")))??;

        trace!(path = %self.path.display(), "Cache snapshot written");
        Ok(())
    }
}

#[async_trait]
impl CacheStore for PersistentCacheStore {
    async fn open(&self, name: &str) -> Result<(), ServiceWorkerError> {
        if self.inner.storage.read().await.has(name) {
            return Ok(());
        }
        self.commit(|storage| {
            storage.open(name);
        })
        .await
    }

    async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), ServiceWorkerError> {
        trace!(cache = %name, key = %entry.key(), "Cache put");
        self.commit(|storage| storage.open(name).put(entry)).await
    }

    async fn put_all(
        &self,
        name: &str,
        entries: Vec<CacheEntry>,
    ) -> Result<(), ServiceWorkerError> {
        self.commit(|storage| {
            let cache = storage.open(name);
            for entry in entries {
                cache.put(entry);
            }
        })
        .await
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
        if !self.inner.storage.read().await.has(name) {
            return Ok(false);
        }
        self.commit(|storage| storage.delete(name)).await
    }

    async fn entry_count(&self, name: &str) -> Result<Option<usize>, ServiceWorkerError> {
        self.inner.entry_count(name).await
    }
}
