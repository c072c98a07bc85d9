//! Service worker registration: the installing/waiting/active state machine.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tapntrip_net::{Network, Request};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::controller::{
    dispatch, EventOutcome, FetchResponse, ServiceWorkerEvent, ServiceWorkerHandlers,
};
use crate::ServiceWorkerError;

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Created, not yet installing.
    #[default]
    Parsed,
    /// Install handler running.
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activate handler running.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced, or install failed.
    Redundant,
}

impl ServiceWorkerState {
    /// Only an activated worker answers fetches.
    pub fn can_intercept_fetch(self) -> bool {
        self == Self::Activated
    }
}

/// A service worker instance.
#[derive(Clone)]
pub struct ServiceWorker {
    pub id: ServiceWorkerId,

    /// Cache version this worker serves.
    pub version: String,

    pub state: ServiceWorkerState,

    /// Error message if install failed.
    pub error: Option<String>,

    /// Time of last state change.
    pub state_changed_at: Instant,

    handlers: Arc<dyn ServiceWorkerHandlers>,
}

impl fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("state", &self.state)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl ServiceWorker {
    pub fn new(version: impl Into<String>, handlers: Arc<dyn ServiceWorkerHandlers>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            version: version.into(),
            state: ServiceWorkerState::Parsed,
            error: None,
            state_changed_at: Instant::now(),
            handlers,
        }
    }

    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }

    pub fn handlers(&self) -> &Arc<dyn ServiceWorkerHandlers> {
        &self.handlers
    }
}

/// Registration state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationEvent {
    /// A new worker started installing.
    UpdateFound { version: String },
    StateChange {
        worker_id: ServiceWorkerId,
        version: String,
        new_state: ServiceWorkerState,
    },
    /// A new worker now controls the scope.
    ControllerChange { version: String },
}

/// A service worker registration.
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    pub installing: Option<ServiceWorker>,

    /// Installed but not active.
    pub waiting: Option<ServiceWorker>,

    pub active: Option<ServiceWorker>,

    /// Promote installed workers immediately.
    skip_waiting: bool,

    /// Used for fetches nobody controls.
    network: Arc<dyn Network>,

    event_tx: mpsc::UnboundedSender<RegistrationEvent>,
}

impl ServiceWorkerRegistration {
    /// Create a registration for `scope`.
    pub fn new(
        scope: Url,
        network: Arc<dyn Network>,
    ) -> (Self, mpsc::UnboundedReceiver<RegistrationEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                scope,
                installing: None,
                waiting: None,
                active: None,
                skip_waiting: false,
                network,
                event_tx,
            },
            event_rx,
        )
    }

    pub fn with_skip_waiting(mut self, skip_waiting: bool) -> Self {
        self.skip_waiting = skip_waiting;
        self
    }

    /// Get the active worker.
    pub fn get_active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref()
    }

    /// Whether `url` falls under this registration's scope.
    pub fn controls(&self, url: &Url) -> bool {
        url.as_str().starts_with(self.scope.as_str())
    }

    fn set_state(&self, worker: &mut ServiceWorker, state: ServiceWorkerState) {
        worker.set_state(state);
        debug!(worker = worker.id.raw(), version = %worker.version, ?state, "Worker state changed");
        let _ = self.event_tx.send(RegistrationEvent::StateChange {
            worker_id: worker.id,
            version: worker.version.clone(),
            new_state: state,
        });
    }

    /// Install a new worker version.
    ///
    /// On failure the new worker becomes redundant and the active worker keeps
    /// serving. On success it waits, or activates at once with skip-waiting.
    pub async fn install(
        &mut self,
        version: impl Into<String>,
        handlers: Arc<dyn ServiceWorkerHandlers>,
    ) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let mut worker = ServiceWorker::new(version, handlers);
        let id = worker.id;
        let _ = self.event_tx.send(RegistrationEvent::UpdateFound {
            version: worker.version.clone(),
        });

        self.set_state(&mut worker, ServiceWorkerState::Installing);
        self.installing = Some(worker.clone());
        let result = worker.handlers.on_install().await;
        self.installing = None;

        if let Err(e) = result {
            warn!(version = %worker.version, error = %e, "Install rejected, keeping current worker");
            worker.error = Some(e.to_string());
            self.set_state(&mut worker, ServiceWorkerState::Redundant);
            return Err(e);
        }

        self.set_state(&mut worker, ServiceWorkerState::Installed);
        if let Some(mut replaced) = self.waiting.replace(worker) {
            self.set_state(&mut replaced, ServiceWorkerState::Redundant);
        }

        if self.skip_waiting {
            self.activate().await?;
        }
        Ok(id)
    }

    /// Activate the waiting worker; returns the cache stores it deleted.
    ///
    /// The worker is promoted only after its activate handler finishes.
    pub async fn activate(&mut self) -> Result<Vec<String>, ServiceWorkerError> {
        let mut worker = self
            .waiting
            .take()
            .ok_or_else(|| ServiceWorkerError::StateError("No waiting worker".to_string()))?;

        self.set_state(&mut worker, ServiceWorkerState::Activating);
        let deleted = worker.handlers.on_activate().await;

        if let Some(mut old) = self.active.take() {
            self.set_state(&mut old, ServiceWorkerState::Redundant);
        }
        self.set_state(&mut worker, ServiceWorkerState::Activated);

        info!(version = %worker.version, scope = %self.scope, "Worker now controls scope");
        let _ = self.event_tx.send(RegistrationEvent::ControllerChange {
            version: worker.version.clone(),
        });
        self.active = Some(worker);
        Ok(deleted)
    }

    /// Route a request to the active worker, or straight to the network.
    pub async fn handle_fetch(&self, request: Request) -> Result<FetchResponse, ServiceWorkerError> {
        match &self.active {
            Some(worker) if worker.state.can_intercept_fetch() && self.controls(&request.url) => {
                Ok(worker.handlers.on_fetch(request).await)
            }
            _ => {
                debug!(url = %request.url, "No controlling worker, passing through");
                let response = self.network.fetch(request).await?;
                Ok(FetchResponse::network(response))
            }
        }
    }

    /// Deliver a functional event to the active worker.
    pub async fn dispatch(
        &self,
        event: ServiceWorkerEvent,
    ) -> Result<EventOutcome, ServiceWorkerError> {
        let worker = self.active.as_ref().ok_or_else(|| {
            ServiceWorkerError::StateError(format!("No active worker for {} event", event.name()))
        })?;
        Ok(dispatch(worker.handlers.as_ref(), event).await)
    }

    /// Unregister: every worker becomes redundant.
    pub fn unregister(&mut self) {
        for slot in [
            self.active.take(),
            self.waiting.take(),
            self.installing.take(),
        ] {
            if let Some(mut worker) = slot {
                self.set_state(&mut worker, ServiceWorkerState::Redundant);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::StatusCode;
    use tapntrip_net::{NetError, Response};

    use crate::clients::Client;
    use crate::notification::Notification;
    use crate::sync::SyncReport;
    use crate::NotificationDefaults;

    /// Handlers with a fixed install outcome that answer every fetch with 200.
    struct Stub {
        version: &'static str,
        install_ok: bool,
    }

    #[async_trait]
    impl ServiceWorkerHandlers for Stub {
        async fn on_install(&self) -> Result<(), ServiceWorkerError> {
            if self.install_ok {
                Ok(())
            } else {
                Err(ServiceWorkerError::InstallFailed {
                    version: self.version.into(),
                    reason: "asset missing".into(),
                })
            }
        }

        async fn on_activate(&self) -> Vec<String> {
            vec!["stale".to_string()]
        }

        async fn on_fetch(&self, request: Request) -> FetchResponse {
            FetchResponse::network(Response::new(request.url, StatusCode::OK, self.version))
        }

        async fn on_push(&self, payload: Option<Bytes>) -> Notification {
            Notification::from_push(
                payload.as_deref(),
                &NotificationDefaults::default(),
                chrono::Utc::now(),
            )
        }

        async fn on_notification_click(&self, _notification: Notification) -> Option<Client> {
            None
        }

        async fn on_sync(&self, tag: &str) -> SyncReport {
            SyncReport::ignored(tag)
        }

        async fn on_periodic_sync(&self, tag: &str) -> SyncReport {
            SyncReport::ignored(tag)
        }
    }

    struct Passthrough;

    #[async_trait]
    impl Network for Passthrough {
        async fn fetch(&self, request: Request) -> Result<Response, NetError> {
            Ok(Response::new(request.url, StatusCode::OK, "network"))
        }
    }

    fn registration() -> (ServiceWorkerRegistration, mpsc::UnboundedReceiver<RegistrationEvent>) {
        ServiceWorkerRegistration::new(
            Url::parse("https://tapntrip.example/").unwrap(),
            Arc::new(Passthrough),
        )
    }

    fn stub(version: &'static str, install_ok: bool) -> Arc<dyn ServiceWorkerHandlers> {
        Arc::new(Stub {
            version,
            install_ok,
        })
    }

    fn get(path: &str) -> Request {
        Request::get(Url::parse("https://tapntrip.example/").unwrap().join(path).unwrap())
    }

    #[test]
    fn test_state_gates_fetch() {
        assert!(ServiceWorkerState::Activated.can_intercept_fetch());
        assert!(!ServiceWorkerState::Installed.can_intercept_fetch());
        assert_eq!(ServiceWorkerState::default(), ServiceWorkerState::Parsed);
    }

    #[tokio::test]
    async fn test_install_then_activate() {
        let (mut reg, mut events) = registration();

        reg.install("v1", stub("v1", true)).await.unwrap();
        assert!(reg.waiting.is_some());
        assert!(reg.active.is_none());

        let deleted = reg.activate().await.unwrap();
        assert_eq!(deleted, vec!["stale"]);
        assert!(reg.get_active().unwrap().is_active());
        assert!(reg.waiting.is_none());

        assert_eq!(
            events.recv().await,
            Some(RegistrationEvent::UpdateFound {
                version: "v1".into()
            })
        );
    }

    #[tokio::test]
    async fn test_failed_install_keeps_active_worker() {
        let (mut reg, _events) = registration();
        reg.install("v1", stub("v1", true)).await.unwrap();
        reg.activate().await.unwrap();

        let result = reg.install("v2", stub("v2", false)).await;
        assert!(matches!(
            result,
            Err(ServiceWorkerError::InstallFailed { .. })
        ));
        assert!(reg.waiting.is_none());
        assert!(reg.installing.is_none());
        assert_eq!(reg.get_active().unwrap().version, "v1");

        let fetched = reg.handle_fetch(get("/index.html")).await.unwrap();
        assert_eq!(fetched.response.text().unwrap(), "v1");
    }

    #[tokio::test]
    async fn test_skip_waiting_activates_immediately() {
        let (reg, _events) = registration();
        let mut reg = reg.with_skip_waiting(true);

        reg.install("v1", stub("v1", true)).await.unwrap();
        reg.install("v2", stub("v2", true)).await.unwrap();

        assert_eq!(reg.get_active().unwrap().version, "v2");
        assert!(reg.waiting.is_none());
    }

    #[tokio::test]
    async fn test_activate_without_waiting_worker() {
        let (mut reg, _events) = registration();
        assert!(matches!(
            reg.activate().await,
            Err(ServiceWorkerError::StateError(_))
        ));
    }

    #[tokio::test]
    async fn test_uncontrolled_fetch_passes_through() {
        let (mut reg, _events) = registration();

        let fetched = reg.handle_fetch(get("/index.html")).await.unwrap();
        assert_eq!(fetched.response.text().unwrap(), "network");

        reg.install("v1", stub("v1", true)).await.unwrap();
        reg.activate().await.unwrap();
        let outside = Request::get(Url::parse("https://cdn.example/lib.js").unwrap());
        let fetched = reg.handle_fetch(outside).await.unwrap();
        assert_eq!(fetched.response.text().unwrap(), "network");
    }

    #[tokio::test]
    async fn test_dispatch_requires_active_worker() {
        let (mut reg, _events) = registration();
        let event = ServiceWorkerEvent::Sync("sync-bookings".into());
        assert!(reg.dispatch(event.clone()).await.is_err());

        reg.install("v1", stub("v1", true)).await.unwrap();
        reg.activate().await.unwrap();
        assert!(matches!(
            reg.dispatch(event).await.unwrap(),
            EventOutcome::Sync(_)
        ));
    }

    #[tokio::test]
    async fn test_unregister_marks_redundant() {
        let (mut reg, mut events) = registration();
        reg.install("v1", stub("v1", true)).await.unwrap();
        reg.activate().await.unwrap();
        while events.try_recv().is_ok() {}

        reg.unregister();
        assert!(reg.get_active().is_none());
        match events.try_recv() {
            Ok(RegistrationEvent::StateChange { new_state, .. }) => {
                assert_eq!(new_state, ServiceWorkerState::Redundant)
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
