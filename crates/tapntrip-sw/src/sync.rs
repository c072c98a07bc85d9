//! Background sync: the offline request queue and replay reports.

use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use tapntrip_net::Request;
use tokio::sync::RwLock;
use url::Url;

use crate::ServiceWorkerError;

/// A request deferred while offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub id: u64,
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub enqueued_at: DateTime<Utc>,
    /// Replay attempts that did not succeed.
    pub attempts: u32,
}

impl QueuedRequest {
    /// Capture `request` for later replay.
    pub fn capture(id: u64, request: &Request) -> Self {
        Self {
            id,
            method: request.method.to_string(),
            url: request.url.to_string(),
            headers: request
                .headers
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect(),
            body: request.body.as_ref().map(|b| b.to_vec()),
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }

    /// Rebuild the request for replay.
    pub fn to_request(&self) -> Result<Request, ServiceWorkerError> {
        let url = Url::parse(&self.url)
            .map_err(|e| ServiceWorkerError::QueueError(format!("bad url '{}': {e}", self.url)))?;
        let method = Method::from_str(&self.method)
            .map_err(|e| ServiceWorkerError::QueueError(format!("bad method: {e}")))?;

        let mut request = Request::new(method, url);
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ServiceWorkerError::QueueError(format!("bad header: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ServiceWorkerError::QueueError(format!("bad header: {e}")))?;
            request.headers.append(name, value);
        }
        request.body = self.body.clone().map(Bytes::from);
        Ok(request)
    }
}

/// Durable store of requests waiting for connectivity.
#[async_trait]
pub trait OfflineQueue: Send + Sync {
    /// Persist a request; returns its queue id.
    async fn enqueue(&self, request: &Request) -> Result<u64, ServiceWorkerError>;

    /// Requests not yet replayed, oldest first.
    async fn pending(&self) -> Result<Vec<QueuedRequest>, ServiceWorkerError>;

    /// Mark a request as replayed so it is not sent again.
    async fn mark_replayed(&self, id: u64) -> Result<(), ServiceWorkerError>;

    /// Record a failed replay; the request stays pending.
    async fn record_attempt(&self, id: u64) -> Result<(), ServiceWorkerError>;
}

/// In-memory offline queue.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    inner: RwLock<MemoryQueueInner>,
}

#[derive(Debug, Default)]
struct MemoryQueueInner {
    next_id: u64,
    pending: Vec<QueuedRequest>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OfflineQueue for MemoryQueue {
    async fn enqueue(&self, request: &Request) -> Result<u64, ServiceWorkerError> {
        let mut inner = self.inner.write().await;
        inner.next_id += 1;
        let id = inner.next_id;
        inner.pending.push(QueuedRequest::capture(id, request));
        Ok(id)
    }

    async fn pending(&self) -> Result<Vec<QueuedRequest>, ServiceWorkerError> {
        Ok(self.inner.read().await.pending.clone())
    }

    async fn mark_replayed(&self, id: u64) -> Result<(), ServiceWorkerError> {
        let mut inner = self.inner.write().await;
        let before = inner.pending.len();
        inner.pending.retain(|r| r.id != id);
        if inner.pending.len() == before {
            return Err(ServiceWorkerError::NotFound(format!("queued request {id}")));
        }
        Ok(())
    }

    async fn record_attempt(&self, id: u64) -> Result<(), ServiceWorkerError> {
        let mut inner = self.inner.write().await;
        let queued = inner
            .pending
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("queued request {id}")))?;
        queued.attempts += 1;
        Ok(())
    }
}

/// Outcome of a sync or periodic sync event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub tag: String,
    /// Whether the tag was recognized.
    pub matched: bool,
    pub replayed: usize,
    pub failed: usize,
}

impl SyncReport {
    /// An acknowledged event that did no work.
    pub fn ignored(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            ..Default::default()
        }
    }
}
