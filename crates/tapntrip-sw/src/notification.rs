//! Push notifications.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::NotificationDefaults;
use crate::ServiceWorkerError;

/// Data-map key holding the arrival timestamp (epoch ms).
pub const ARRIVAL_KEY: &str = "dateOfArrival";

/// Data-map key holding the correlation key.
pub const PRIMARY_KEY: &str = "primaryKey";

/// Unique identifier for a displayed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationId(u64);

impl NotificationId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// A notification descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub id: NotificationId,
    pub title: String,
    pub body: String,
    pub icon: Option<String>,
    pub badge: Option<String>,
    pub vibrate: Vec<u32>,
    pub data: Map<String, Value>,
}

impl Notification {
    /// Build the notification for a push payload.
    ///
    /// A missing or non UTF-8 payload yields an empty body.
    pub fn from_push(
        payload: Option<&[u8]>,
        defaults: &NotificationDefaults,
        arrived_at: DateTime<Utc>,
    ) -> Self {
        let body = match payload.map(std::str::from_utf8) {
            None => String::new(),
            Some(Ok(text)) => text.to_string(),
            Some(Err(e)) => {
                warn!(error = %e, "Push payload is not valid UTF-8, showing empty body");
                String::new()
            }
        };

        let mut data = Map::new();
        data.insert(
            ARRIVAL_KEY.to_string(),
            Value::from(arrived_at.timestamp_millis()),
        );
        data.insert(PRIMARY_KEY.to_string(), Value::from(correlation_key()));

        Self {
            id: NotificationId::new(),
            title: defaults.title.clone(),
            body,
            icon: defaults.icon.clone(),
            badge: defaults.badge.clone(),
            vibrate: defaults.vibrate.clone(),
            data,
        }
    }

    /// Arrival timestamp from the data map.
    pub fn arrived_at(&self) -> Option<DateTime<Utc>> {
        self.data
            .get(ARRIVAL_KEY)
            .and_then(Value::as_i64)
            .and_then(DateTime::from_timestamp_millis)
    }
}

/// Notification display provided by the hosting runtime.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Display a notification.
    async fn show(&self, notification: Notification) -> Result<(), ServiceWorkerError>;

    /// Close a notification.
    async fn close(&self, id: NotificationId);
}

/// In-memory notification center.
#[derive(Debug, Default)]
pub struct NotificationCenter {
    visible: RwLock<Vec<Notification>>,
    permission_denied: bool,
}

impl NotificationCenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A center where the user has denied notification permission.
    pub fn denied() -> Self {
        Self {
            visible: RwLock::new(Vec::new()),
            permission_denied: true,
        }
    }

    /// Currently visible notifications, oldest first.
    pub async fn visible(&self) -> Vec<Notification> {
        self.visible.read().await.clone()
    }
}

#[async_trait]
impl Notifier for NotificationCenter {
    async fn show(&self, notification: Notification) -> Result<(), ServiceWorkerError> {
        if self.permission_denied {
            return Err(ServiceWorkerError::StateError(
                "Notification permission denied".to_string(),
            ));
        }
        debug!(id = notification.id.raw(), title = %notification.title, "Showing notification");
        self.visible.write().await.push(notification);
        Ok(())
    }

    async fn close(&self, id: NotificationId) {
        self.visible.write().await.retain(|n| n.id != id);
    }
}

/// Generate an opaque correlation key.
fn correlation_key() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
    format!("{:016x}-{:04x}", nanos, COUNTER.fetch_add(1, Ordering::Relaxed))
}
