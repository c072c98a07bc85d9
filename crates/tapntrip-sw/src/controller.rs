//! The offline controller: lifecycle, fetch, push and sync handlers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::future::try_join_all;
use http::{header, HeaderValue, Method, StatusCode};
use tapntrip_common::{retry_if, TapError};
use tapntrip_net::{NetError, Network, Request, Response, TokenSource};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{cache_key, CacheStorage, MemoryCacheStorage};
use crate::clients::{Client, ClientType, Clients, ClientsHost};
use crate::config::ControllerConfig;
use crate::notification::{Notification, NotificationCenter, NotificationId, Notifier};
use crate::sync::{OfflineQueue, SyncReport};
use crate::ServiceWorkerError;

/// Body of the synthesized response when nothing else is available.
const OFFLINE_BODY: &str = "Network error happened";

/// Where a fetch response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    OfflinePage,
    /// The 408 fallback.
    Synthesized,
}

/// Fetch event response.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub response: Response,
    pub source: ResponseSource,
}

impl FetchResponse {
    pub fn network(response: Response) -> Self {
        Self {
            response,
            source: ResponseSource::Network,
        }
    }

    /// `408 Request Timeout` with a short plain-text body.
    pub fn request_timeout(url: Url) -> Self {
        let response = Response::new(url, StatusCode::REQUEST_TIMEOUT, OFFLINE_BODY).header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain"),
        );
        Self {
            response,
            source: ResponseSource::Synthesized,
        }
    }

    /// Whether the response was served from the cache store.
    pub fn from_cache(&self) -> bool {
        matches!(
            self.source,
            ResponseSource::Cache | ResponseSource::OfflinePage
        )
    }
}

/// Capabilities the hosting runtime lends to the controller.
#[derive(Clone)]
pub struct HostServices {
    pub caches: Arc<dyn CacheStorage>,
    pub notifier: Arc<dyn Notifier>,
    pub clients: Arc<dyn ClientsHost>,
}

impl HostServices {
    /// Host backed by the in-memory implementations.
    pub fn in_memory() -> Self {
        Self {
            caches: Arc::new(MemoryCacheStorage::new()),
            notifier: Arc::new(NotificationCenter::new()),
            clients: Arc::new(Clients::new()),
        }
    }
}

/// Controller events, reported alongside logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    Installed {
        version: String,
        assets: usize,
    },
    InstallFailed {
        version: String,
        reason: String,
    },
    Activated {
        deleted: Vec<String>,
        claimed: usize,
    },
    /// A background cache write was rejected.
    CacheWriteFailed {
        url: String,
        error: String,
    },
    NotificationShown(NotificationId),
    NotificationFailed {
        error: String,
    },
    SyncCompleted(SyncReport),
}

/// Event handlers a service worker exposes to its registration.
#[async_trait]
pub trait ServiceWorkerHandlers: Send + Sync {
    /// Precache the app shell. Failure rejects this version.
    async fn on_install(&self) -> Result<(), ServiceWorkerError>;

    /// Prune stale stores and claim clients; returns the deleted store names.
    async fn on_activate(&self) -> Vec<String>;

    /// Answer an intercepted request. Always yields a response.
    async fn on_fetch(&self, request: Request) -> FetchResponse;

    /// Surface a push message as a notification.
    async fn on_push(&self, payload: Option<Bytes>) -> Notification;

    /// Handle a click on a notification; returns the focused or opened client.
    async fn on_notification_click(&self, notification: Notification) -> Option<Client>;

    async fn on_sync(&self, tag: &str) -> SyncReport;

    async fn on_periodic_sync(&self, tag: &str) -> SyncReport;
}

/// Events the hosting runtime delivers.
#[derive(Debug, Clone)]
pub enum ServiceWorkerEvent {
    Install,
    Activate,
    Fetch(Request),
    Push(Option<Bytes>),
    NotificationClick(Notification),
    Sync(String),
    PeriodicSync(String),
}

impl ServiceWorkerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Activate => "activate",
            Self::Fetch(_) => "fetch",
            Self::Push(_) => "push",
            Self::NotificationClick(_) => "notificationclick",
            Self::Sync(_) => "sync",
            Self::PeriodicSync(_) => "periodicsync",
        }
    }
}

/// Result of a dispatched event.
#[derive(Debug, Clone)]
pub enum EventOutcome {
    Install(Result<(), ServiceWorkerError>),
    Activate(Vec<String>),
    Fetch(FetchResponse),
    Push(Notification),
    NotificationClick(Option<Client>),
    Sync(SyncReport),
}

/// Route an event to the matching handler.
pub async fn dispatch(
    handlers: &dyn ServiceWorkerHandlers,
    event: ServiceWorkerEvent,
) -> EventOutcome {
    debug!(event = event.name(), "Dispatching event");
    match event {
        ServiceWorkerEvent::Install => EventOutcome::Install(handlers.on_install().await),
        ServiceWorkerEvent::Activate => EventOutcome::Activate(handlers.on_activate().await),
        ServiceWorkerEvent::Fetch(request) => EventOutcome::Fetch(handlers.on_fetch(request).await),
        ServiceWorkerEvent::Push(payload) => EventOutcome::Push(handlers.on_push(payload).await),
        ServiceWorkerEvent::NotificationClick(notification) => {
            EventOutcome::NotificationClick(handlers.on_notification_click(notification).await)
        }
        ServiceWorkerEvent::Sync(tag) => EventOutcome::Sync(handlers.on_sync(&tag).await),
        ServiceWorkerEvent::PeriodicSync(tag) => {
            EventOutcome::Sync(handlers.on_periodic_sync(&tag).await)
        }
    }
}

/// Offline cache controller.
pub struct OfflineController {
    config: ControllerConfig,
    host: HostServices,
    network: Arc<dyn Network>,
    tokens: Option<Arc<dyn TokenSource>>,
    queue: Option<Arc<dyn OfflineQueue>>,
    precache: Vec<Url>,
    offline_page: Url,
    events: mpsc::UnboundedSender<ControllerEvent>,
    pending_writes: Mutex<JoinSet<()>>,
}

impl OfflineController {
    /// Create a controller; the receiver yields [`ControllerEvent`]s.
    pub fn new(
        config: ControllerConfig,
        host: HostServices,
        network: Arc<dyn Network>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ControllerEvent>), ServiceWorkerError> {
        config.validate()?;
        let precache = config.precache_urls()?;
        let offline_page = config.offline_page_url()?;
        let (events, event_rx) = mpsc::unbounded_channel();

        let controller = Self {
            config,
            host,
            network,
            tokens: None,
            queue: None,
            precache,
            offline_page,
            events,
            pending_writes: Mutex::new(JoinSet::new()),
        };
        Ok((controller, event_rx))
    }

    /// Attach a bearer token source for same-origin requests.
    pub fn with_token_source(mut self, tokens: Arc<dyn TokenSource>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Attach the offline queue replayed on sync.
    pub fn with_offline_queue(mut self, queue: Arc<dyn OfflineQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Name of the current cache store.
    pub fn version(&self) -> &str {
        &self.config.version_tag
    }

    /// Defer a request until the next sync.
    pub async fn defer(&self, request: &Request) -> Result<u64, ServiceWorkerError> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| ServiceWorkerError::StateError("No offline queue attached".into()))?;
        let id = queue.enqueue(request).await?;
        info!(id, url = %request.url, "Deferred request until sync");
        Ok(id)
    }

    /// Wait for all background cache writes to finish.
    pub async fn flush(&self) {
        loop {
            let mut writes = std::mem::take(&mut *self.lock_writes());
            if writes.is_empty() {
                return;
            }
            while let Some(result) = writes.join_next().await {
                if let Err(e) = result {
                    warn!(error = %e, "Cache write task did not complete");
                }
            }
        }
    }

    fn lock_writes(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.pending_writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ControllerEvent) {
        // A dropped receiver only means nobody is listening
        let _ = self.events.send(event);
    }

    /// Add the session token to same-origin requests that carry no credentials.
    async fn authorize(&self, mut request: Request) -> Request {
        if !self.config.attach_session_token
            || request.headers.contains_key(header::AUTHORIZATION)
            || request.url.origin() != self.config.origin.origin()
        {
            return request;
        }
        let Some(tokens) = &self.tokens else {
            return request;
        };
        let Some(token) = tokens.bearer_token().await else {
            return request;
        };

        match HeaderValue::from_str(&format!("Bearer {token}")) {
            Ok(mut value) => {
                value.set_sensitive(true);
                request.headers.insert(header::AUTHORIZATION, value);
            }
            Err(e) => warn!(error = %e, "Session token is not a valid header value"),
        }
        request
    }

    async fn fetch_asset(&self, url: &Url) -> Result<(Request, Response), ServiceWorkerError> {
        let request = Request::get(url.clone());
        let response = self.network.fetch(request.clone()).await?;
        if !response.ok() {
            return Err(ServiceWorkerError::NetworkError(format!(
                "GET {} returned {}",
                url.path(),
                response.status.as_u16()
            )));
        }
        Ok((request, response))
    }

    async fn precache(&self) -> Result<usize, ServiceWorkerError> {
        let exchanges = try_join_all(self.precache.iter().map(|url| self.fetch_asset(url))).await?;

        self.host.caches.put_all(self.version(), &exchanges).await?;
        Ok(exchanges.len())
    }

    fn spawn_cache_write(&self, request: Request, response: Response) {
        let caches = Arc::clone(&self.host.caches);
        let events = self.events.clone();
        let version = self.config.version_tag.clone();

        let mut writes = self.lock_writes();
        while writes.try_join_next().is_some() {}
        writes.spawn(async move {
            if let Err(e) = caches.put(&version, &request, &response).await {
                warn!(url = %request.url, error = %e, "Cache write failed");
                let _ = events.send(ControllerEvent::CacheWriteFailed {
                    url: request.url.to_string(),
                    error: e.to_string(),
                });
            }
        });
    }

    async fn fallback(&self, request: &Request) -> FetchResponse {
        let version = self.version();
        if let Some(response) = self.host.caches.match_request(version, request).await {
            debug!(url = %request.url, "Serving from cache");
            return FetchResponse {
                response,
                source: ResponseSource::Cache,
            };
        }

        if request.is_navigation() {
            let offline = Request::get(self.offline_page.clone());
            if let Some(response) = self.host.caches.match_request(version, &offline).await {
                debug!(url = %request.url, "Serving offline page");
                return FetchResponse {
                    response,
                    source: ResponseSource::OfflinePage,
                };
            }
            warn!(page = %self.offline_page, "Offline page missing from cache");
        }

        FetchResponse::request_timeout(request.url.clone())
    }

    /// Send one queued request. Transport failures and 5xx are retried,
    /// any other non-2xx status fails at once.
    async fn replay_one(&self, request: Request) -> Result<Response, TapError> {
        let retry = self.config.replay.retry_config();
        let network = &self.network;

        retry_if(
            &retry,
            || {
                let request = request.clone();
                async move {
                    let response = network.fetch(request).await.map_err(transport_error)?;
                    if !response.ok() {
                        return Err(TapError::Status(response.status.as_u16()));
                    }
                    Ok(response)
                }
            },
            TapError::is_retryable,
        )
        .await
    }

    async fn replay(&self, tag: &str) -> SyncReport {
        let mut report = SyncReport {
            tag: tag.to_string(),
            matched: true,
            ..Default::default()
        };

        let Some(queue) = &self.queue else {
            debug!(tag, "No offline queue attached");
            return report;
        };

        let pending = match queue.pending().await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(tag, error = %e, "Could not read offline queue");
                return report;
            }
        };

        for item in pending {
            let request = match item.to_request() {
                Ok(request) => self.authorize(request).await,
                Err(e) => {
                    warn!(id = item.id, error = %e, "Skipping unreadable queued request");
                    report.failed += 1;
                    continue;
                }
            };

            let succeeded = match self.replay_one(request).await {
                Ok(_) => true,
                Err(e) => {
                    warn!(id = item.id, category = e.category(), error = %e, "Replay failed");
                    false
                }
            };

            if succeeded {
                match queue.mark_replayed(item.id).await {
                    Ok(()) => report.replayed += 1,
                    Err(e) => {
                        warn!(id = item.id, error = %e, "Could not mark request replayed");
                        report.failed += 1;
                    }
                }
            } else {
                if let Err(e) = queue.record_attempt(item.id).await {
                    warn!(id = item.id, error = %e, "Could not record replay attempt");
                }
                report.failed += 1;
            }
        }

        info!(
            tag,
            replayed = report.replayed,
            failed = report.failed,
            "Sync finished"
        );
        report
    }
}

fn transport_error(err: NetError) -> TapError {
    match err {
        NetError::Timeout(after) => TapError::Timeout(after),
        NetError::Cancelled => TapError::Cancelled,
        other => TapError::network_with_source("request not delivered", other),
    }
}

/// Only complete, successful GET responses over http(s) are stored.
fn is_cacheable(request: &Request, response: &Response) -> bool {
    request.method == Method::GET
        && response.status.is_success()
        && response.status != StatusCode::PARTIAL_CONTENT
        && matches!(request.url.scheme(), "http" | "https")
}

#[async_trait]
impl ServiceWorkerHandlers for OfflineController {
    async fn on_install(&self) -> Result<(), ServiceWorkerError> {
        let version = self.version().to_string();
        info!(version = %version, assets = self.precache.len(), "Installing");

        match self.precache().await {
            Ok(assets) => {
                info!(version = %version, assets, "Install complete");
                self.emit(ControllerEvent::Installed { version, assets });
                Ok(())
            }
            Err(e) => {
                error!(version = %version, error = %e, "Install failed");
                let reason = e.to_string();
                self.emit(ControllerEvent::InstallFailed {
                    version: version.clone(),
                    reason: reason.clone(),
                });
                Err(ServiceWorkerError::InstallFailed { version, reason })
            }
        }
    }

    async fn on_activate(&self) -> Vec<String> {
        let current = self.version();
        let mut deleted = Vec::new();

        for name in self.host.caches.keys().await {
            if name != current && self.host.caches.delete(&name).await {
                info!(cache = %name, "Deleted stale cache");
                deleted.push(name);
            }
        }

        let claimed = self.host.clients.claim().await;
        info!(version = current, claimed, "Activated");
        self.emit(ControllerEvent::Activated {
            deleted: deleted.clone(),
            claimed,
        });
        deleted
    }

    async fn on_fetch(&self, request: Request) -> FetchResponse {
        let outbound = self.authorize(request.clone()).await;

        match self.network.fetch(outbound).await {
            Ok(response) => {
                if is_cacheable(&request, &response) {
                    self.spawn_cache_write(request, response.clone());
                }
                FetchResponse::network(response)
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network unavailable, falling back");
                self.fallback(&request).await
            }
        }
    }

    async fn on_push(&self, payload: Option<Bytes>) -> Notification {
        let notification =
            Notification::from_push(payload.as_deref(), &self.config.notification, Utc::now());

        match self.host.notifier.show(notification.clone()).await {
            Ok(()) => self.emit(ControllerEvent::NotificationShown(notification.id)),
            Err(e) => {
                warn!(error = %e, "Could not show notification");
                self.emit(ControllerEvent::NotificationFailed {
                    error: e.to_string(),
                });
            }
        }
        notification
    }

    async fn on_notification_click(&self, notification: Notification) -> Option<Client> {
        self.host.notifier.close(notification.id).await;

        let root = self.config.app_root();
        let root_key = cache_key(&root);
        let windows = self.host.clients.match_all(ClientType::Window).await;

        if let Some(existing) = windows.iter().find(|c| cache_key(&c.url) == root_key) {
            match self.host.clients.focus(&existing.id).await {
                Ok(client) => return Some(client),
                Err(e) => warn!(client = %existing.id, error = %e, "Could not focus client"),
            }
        }

        match self.host.clients.open_window(&root).await {
            Ok(client) => Some(client),
            Err(e) => {
                warn!(url = %root, error = %e, "Could not open window");
                None
            }
        }
    }

    async fn on_sync(&self, tag: &str) -> SyncReport {
        if tag != self.config.sync_tag {
            debug!(tag, "Ignoring unknown sync tag");
            return SyncReport::ignored(tag);
        }
        let report = self.replay(tag).await;
        self.emit(ControllerEvent::SyncCompleted(report.clone()));
        report
    }

    async fn on_periodic_sync(&self, tag: &str) -> SyncReport {
        if tag != self.config.periodic_sync_tag {
            debug!(tag, "Ignoring unknown periodic sync tag");
            return SyncReport::ignored(tag);
        }
        let report = self.replay(tag).await;
        self.emit(ControllerEvent::SyncCompleted(report.clone()));
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapntrip_net::NetError;

    struct Offline;

    #[async_trait]
    impl Network for Offline {
        async fn fetch(&self, request: Request) -> Result<Response, NetError> {
            Err(NetError::Offline(request.url.to_string()))
        }
    }

    struct Echo;

    #[async_trait]
    impl Network for Echo {
        async fn fetch(&self, request: Request) -> Result<Response, NetError> {
            let auth = request
                .headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("none")
                .to_string();
            Ok(Response::new(request.url, StatusCode::OK, auth))
        }
    }

    fn controller(network: Arc<dyn Network>) -> OfflineController {
        OfflineController::new(ControllerConfig::default(), HostServices::in_memory(), network)
            .unwrap()
            .0
    }

    #[test]
    fn test_is_cacheable() {
        let url = Url::parse("http://localhost:3000/app.js").unwrap();
        let get = Request::get(url.clone());
        let ok = Response::new(url.clone(), StatusCode::OK, "");

        assert!(is_cacheable(&get, &ok));
        assert!(!is_cacheable(
            &get,
            &Response::new(url.clone(), StatusCode::PARTIAL_CONTENT, "")
        ));
        assert!(!is_cacheable(
            &get,
            &Response::new(url.clone(), StatusCode::NOT_FOUND, "")
        ));
        assert!(!is_cacheable(&Request::post(url, Bytes::new()), &ok));
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = ControllerConfig::default();
        config.version_tag = String::new();
        let result = OfflineController::new(config, HostServices::in_memory(), Arc::new(Offline));
        assert!(matches!(result, Err(ServiceWorkerError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_offline_uncached_subresource_is_408() {
        let sw = controller(Arc::new(Offline));
        let url = Url::parse("http://localhost:3000/api/hotels").unwrap();

        let fetched = sw.on_fetch(Request::get(url)).await;
        assert_eq!(fetched.source, ResponseSource::Synthesized);
        assert_eq!(fetched.response.status, StatusCode::REQUEST_TIMEOUT);
        assert_eq!(
            fetched.response.headers[header::CONTENT_TYPE],
            "text/plain"
        );
        assert!(!fetched.from_cache());
    }

    #[tokio::test]
    async fn test_token_only_sent_same_origin() {
        let tokens = Arc::new(tapntrip_net::TokenStore::new());
        tokens.set("s3cret", chrono::Duration::minutes(5)).await;
        let sw = controller(Arc::new(Echo)).with_token_source(tokens);

        let same = Url::parse("http://localhost:3000/api/me").unwrap();
        let fetched = sw.on_fetch(Request::get(same)).await;
        assert_eq!(fetched.response.text().unwrap(), "Bearer s3cret");

        let cross = Url::parse("https://maps.example/tiles/1").unwrap();
        let fetched = sw.on_fetch(Request::get(cross)).await;
        assert_eq!(fetched.response.text().unwrap(), "none");
        sw.flush().await;
    }

    #[tokio::test]
    async fn test_unknown_sync_tag_is_acknowledged() {
        let sw = controller(Arc::new(Offline));
        let report = sw.on_sync("sync-something-else").await;
        assert!(!report.matched);
        assert_eq!(report.replayed, 0);

        let report = sw.on_periodic_sync("refresh-listings").await;
        assert!(report.matched);
    }

    #[tokio::test]
    async fn test_defer_requires_queue() {
        let sw = controller(Arc::new(Offline));
        let url = Url::parse("http://localhost:3000/api/bookings").unwrap();
        assert!(matches!(
            sw.defer(&Request::post(url, Bytes::new())).await,
            Err(ServiceWorkerError::StateError(_))
        ));
    }

    /// Cache storage whose writes wait for a permit.
    struct GatedCaches {
        inner: MemoryCacheStorage,
        gate: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl CacheStorage for GatedCaches {
        async fn open(&self, name: &str) -> Result<(), ServiceWorkerError> {
            self.inner.open(name).await
        }

        async fn has(&self, name: &str) -> bool {
            self.inner.has(name).await
        }

        async fn keys(&self) -> Vec<String> {
            self.inner.keys().await
        }

        async fn delete(&self, name: &str) -> bool {
            self.inner.delete(name).await
        }

        async fn put(
            &self,
            cache: &str,
            request: &Request,
            response: &Response,
        ) -> Result<(), ServiceWorkerError> {
            let _permit = self.gate.acquire().await.unwrap();
            self.inner.put(cache, request, response).await
        }

        async fn put_all(
            &self,
            cache: &str,
            exchanges: &[(Request, Response)],
        ) -> Result<(), ServiceWorkerError> {
            self.inner.put_all(cache, exchanges).await
        }

        async fn match_request(&self, cache: &str, request: &Request) -> Option<Response> {
            self.inner.match_request(cache, request).await
        }

        async fn entry_count(&self, cache: &str) -> Option<usize> {
            self.inner.entry_count(cache).await
        }
    }

    #[tokio::test]
    async fn test_fetch_does_not_wait_for_running_flush() {
        let caches = Arc::new(GatedCaches {
            inner: MemoryCacheStorage::new(),
            gate: tokio::sync::Semaphore::new(0),
        });
        let host = HostServices {
            caches: caches.clone(),
            ..HostServices::in_memory()
        };
        let sw = Arc::new(
            OfflineController::new(ControllerConfig::default(), host, Arc::new(Echo))
                .unwrap()
                .0,
        );
        let first = Url::parse("http://localhost:3000/static/js/bundle.js").unwrap();
        let second = Url::parse("http://localhost:3000/static/css/main.css").unwrap();

        sw.on_fetch(Request::get(first.clone())).await;
        let flushing = tokio::spawn({
            let sw = sw.clone();
            async move { sw.flush().await }
        });
        while !sw.lock_writes().is_empty() {
            tokio::task::yield_now().await;
        }

        let fetched = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            sw.on_fetch(Request::get(second.clone())),
        )
        .await
        .expect("fetch blocked behind flush");
        assert_eq!(fetched.source, ResponseSource::Network);

        caches.gate.add_permits(2);
        flushing.await.unwrap();
        sw.flush().await;
        assert!(sw.lock_writes().is_empty());
        assert_eq!(caches.entry_count("tapntrip-v1").await, Some(2));
    }

    #[tokio::test]
    async fn test_dispatch_routes_push() {
        let sw = controller(Arc::new(Offline));
        let outcome = dispatch(
            &sw,
            ServiceWorkerEvent::Push(Some(Bytes::from_static(b"Check-in opens"))),
        )
        .await;

        match outcome {
            EventOutcome::Push(notification) => assert_eq!(notification.body, "Check-in opens"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
