//! # TapNTrip Service Worker
//!
//! Offline cache controller for the TapNTrip front end.
//!
//! ## Features
//!
//! - **Lifecycle**: install (precache the app shell), activate (prune stale versions)
//! - **Fetch Interception**: network-first, cache fallback, offline page last
//! - **Cache API**: versioned stores keyed by request, honoring `Vary`
//! - **Notifications**: push payloads surfaced as notifications, clicks open the app
//! - **Sync**: background and periodic sync replay an offline request queue
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerRegistration
//!     ├── installing / waiting / active (ServiceWorker)
//!     │       └── Arc<dyn ServiceWorkerHandlers>  (OfflineController)
//!     └── scope
//!
//! OfflineController
//!     ├── dyn Network          (tapntrip-net)
//!     ├── HostServices
//!     │       ├── dyn CacheStorage ── Cache ── Request → CacheEntry
//!     │       ├── dyn Notifier
//!     │       └── dyn ClientsHost
//!     ├── dyn TokenSource      (optional)
//!     └── dyn OfflineQueue     (optional)
//! ```

use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod config;
pub mod controller;
pub mod notification;
pub mod registration;
pub mod sqlite_queue;
pub mod sync;

pub use cache::{Cache, CacheEntry, CacheStorage, MemoryCacheStorage};
pub use clients::{Client, ClientType, Clients, ClientsHost};
pub use config::{ControllerConfig, NotificationDefaults, ReplayConfig};
pub use controller::{
    dispatch, ControllerEvent, EventOutcome, FetchResponse, HostServices, OfflineController,
    ResponseSource, ServiceWorkerEvent, ServiceWorkerHandlers,
};
pub use notification::{Notification, NotificationCenter, NotificationId, Notifier};
pub use registration::{
    RegistrationEvent, ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration,
    ServiceWorkerState,
};
pub use sqlite_queue::SqliteQueue;
pub use sync::{MemoryQueue, OfflineQueue, QueuedRequest, SyncReport};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerError {
    #[error("Install of {version} failed: {reason}")]
    InstallFailed { version: String, reason: String },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Cache quota exceeded: {used} of {limit} bytes")]
    QuotaExceeded { used: usize, limit: usize },

    #[error("Queue error: {0}")]
    QueueError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<tapntrip_net::NetError> for ServiceWorkerError {
    fn from(err: tapntrip_net::NetError) -> Self {
        Self::NetworkError(err.to_string())
    }
}
