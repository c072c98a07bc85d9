//! Cache API: named, versioned request/response stores.

use async_trait::async_trait;
use chrono::Utc;
use hashbrown::HashMap;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use tapntrip_net::{Request, Response};
use tokio::sync::RwLock;
use tracing::{debug, trace};
use url::Url;

use crate::ServiceWorkerError;

/// Normalized cache key: the request URL without its fragment.
pub fn cache_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL (fragment stripped).
    pub url: String,

    /// Request method.
    pub method: String,

    /// Request header values named by the response's `Vary` header.
    pub vary: Vec<(String, Option<String>)>,

    /// Response status.
    pub status: u16,

    /// Response headers, in order.
    pub headers: Vec<(String, String)>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: i64,
}

impl CacheEntry {
    /// Snapshot a request/response exchange.
    pub fn from_exchange(request: &Request, response: &Response) -> Self {
        let vary = vary_header_names(&response.headers)
            .into_iter()
            .map(|name| {
                let value = request
                    .headers
                    .get(name.as_str())
                    .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned());
                (name, value)
            })
            .collect();

        Self {
            url: cache_key(&request.url),
            method: request.method.to_string(),
            vary,
            status: response.status.as_u16(),
            headers: response
                .headers
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect(),
            body: response.bytes().to_vec(),
            cached_at: Utc::now().timestamp_millis(),
        }
    }

    /// Whether the stored `Vary` values match `request`.
    pub fn matches_vary(&self, request: &Request) -> bool {
        self.vary.iter().all(|(name, stored)| {
            if name == "*" {
                return false;
            }
            let current = request
                .headers
                .get(name.as_str())
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned());
            current == *stored
        })
    }

    /// Rebuild the response.
    pub fn to_response(&self) -> Result<Response, ServiceWorkerError> {
        let url = Url::parse(&self.url)
            .map_err(|e| ServiceWorkerError::CacheError(format!("corrupt entry url: {e}")))?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| ServiceWorkerError::CacheError(format!("corrupt entry status: {e}")))?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) else {
                continue;
            };
            headers.append(name, value);
        }

        Ok(Response::with_headers(url, status, headers, self.body.clone()))
    }

    /// Approximate storage footprint.
    pub fn size_bytes(&self) -> usize {
        self.body.len()
            + self.url.len()
            + self
                .headers
                .iter()
                .map(|(n, v)| n.len() + v.len())
                .sum::<usize>()
    }
}

fn vary_header_names(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect()
}

/// A cache instance.
#[derive(Debug, Clone, Default)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Entries per normalized URL; more than one only when `Vary` differs.
    entries: HashMap<String, Vec<CacheEntry>>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request. Only GET requests ever match.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        if request.method != Method::GET {
            return None;
        }
        self.entries
            .get(&cache_key(&request.url))?
            .iter()
            .find(|entry| entry.matches_vary(request))
    }

    /// Store an entry, replacing any entry the same request would match.
    pub fn put(&mut self, request: &Request, entry: CacheEntry) {
        let slot = self.entries.entry(entry.url.clone()).or_default();
        slot.retain(|existing| !existing.matches_vary(request));
        slot.push(entry);
    }

    /// Delete entries matching a request.
    pub fn delete(&mut self, request: &Request) -> bool {
        let key = cache_key(&request.url);
        let Some(slot) = self.entries.get_mut(&key) else {
            return false;
        };
        let before = slot.len();
        slot.retain(|existing| !existing.matches_vary(request));
        let removed = slot.len() != before;
        if slot.is_empty() {
            self.entries.remove(&key);
        }
        removed
    }

    /// Get all keys (URLs), sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.entries.keys().map(|s| s.as_str()).collect();
        keys.sort_unstable();
        keys
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Approximate storage footprint.
    pub fn size_bytes(&self) -> usize {
        self.entries
            .values()
            .flatten()
            .map(CacheEntry::size_bytes)
            .sum()
    }
}

// ==================== Cache Storage ====================

/// Named cache stores provided by the hosting runtime.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a cache, creating it if it doesn't exist.
    async fn open(&self, name: &str) -> Result<(), ServiceWorkerError>;

    /// Check if a cache exists.
    async fn has(&self, name: &str) -> bool;

    /// All cache names, sorted.
    async fn keys(&self) -> Vec<String>;

    /// Delete a cache.
    async fn delete(&self, name: &str) -> bool;

    /// Store one response in `cache`.
    async fn put(
        &self,
        cache: &str,
        request: &Request,
        response: &Response,
    ) -> Result<(), ServiceWorkerError>;

    /// Store several responses in `cache`; either all are written or none.
    async fn put_all(
        &self,
        cache: &str,
        exchanges: &[(Request, Response)],
    ) -> Result<(), ServiceWorkerError>;

    /// Look up a request in `cache`.
    async fn match_request(&self, cache: &str, request: &Request) -> Option<Response>;

    /// Number of entries in `cache`, `None` if it doesn't exist.
    async fn entry_count(&self, cache: &str) -> Option<usize>;
}

/// In-memory cache storage with an optional byte quota.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<HashMap<String, Cache>>,
    quota_bytes: Option<usize>,
}

impl MemoryCacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create storage that rejects writes beyond `quota_bytes` in total.
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            caches: RwLock::new(HashMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }

    /// Total bytes held across every store.
    pub async fn used_bytes(&self) -> usize {
        self.caches.read().await.values().map(Cache::size_bytes).sum()
    }

    /// Apply `entries` to a copy of `cache` and check the quota against the
    /// result, so replaced entries no longer count.
    fn stage<'a>(
        &self,
        caches: &HashMap<String, Cache>,
        cache: &str,
        entries: impl IntoIterator<Item = (&'a Request, CacheEntry)>,
    ) -> Result<Cache, ServiceWorkerError> {
        let mut staged = caches
            .get(cache)
            .cloned()
            .unwrap_or_else(|| Cache::new(cache));
        for (request, entry) in entries {
            staged.put(request, entry);
        }

        if let Some(limit) = self.quota_bytes {
            let others = caches
                .iter()
                .filter(|(name, _)| name.as_str() != cache)
                .map(|(_, c)| c.size_bytes())
                .sum::<usize>();
            let used = others + staged.size_bytes();
            if used > limit {
                return Err(ServiceWorkerError::QuotaExceeded { used, limit });
            }
        }
        Ok(staged)
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<(), ServiceWorkerError> {
        let mut caches = self.caches.write().await;
        if !caches.contains_key(name) {
            debug!(cache = name, "Creating cache");
            caches.insert(name.to_string(), Cache::new(name));
        }
        Ok(())
    }

    async fn has(&self, name: &str) -> bool {
        self.caches.read().await.contains_key(name)
    }

    async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.caches.read().await.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    async fn delete(&self, name: &str) -> bool {
        self.caches.write().await.remove(name).is_some()
    }

    async fn put(
        &self,
        cache: &str,
        request: &Request,
        response: &Response,
    ) -> Result<(), ServiceWorkerError> {
        let entry = CacheEntry::from_exchange(request, response);
        trace!(cache, url = %entry.url, "Cache put");

        let mut caches = self.caches.write().await;
        let staged = self.stage(&caches, cache, [(request, entry)])?;
        caches.insert(cache.to_string(), staged);
        Ok(())
    }

    async fn put_all(
        &self,
        cache: &str,
        exchanges: &[(Request, Response)],
    ) -> Result<(), ServiceWorkerError> {
        let entries = exchanges
            .iter()
            .map(|(request, response)| (request, CacheEntry::from_exchange(request, response)));

        let mut caches = self.caches.write().await;
        let staged = self.stage(&caches, cache, entries)?;
        caches.insert(cache.to_string(), staged);
        debug!(cache, count = exchanges.len(), "Cache put_all");
        Ok(())
    }

    async fn match_request(&self, cache: &str, request: &Request) -> Option<Response> {
        let caches = self.caches.read().await;
        let entry = caches.get(cache)?.match_request(request)?;
        entry.to_response().ok()
    }

    async fn entry_count(&self, cache: &str) -> Option<usize> {
        self.caches.read().await.get(cache).map(Cache::len)
    }
}
