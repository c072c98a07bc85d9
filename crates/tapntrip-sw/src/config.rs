//! Controller configuration.
//!
//! The version tag and the static asset list are the only cache invalidation
//! mechanism: bump the tag to force a fresh install.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tapntrip_common::RetryConfig;
use url::Url;

use crate::ServiceWorkerError;

/// Offline controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Name of the current cache store.
    pub version_tag: String,

    /// Application origin; relative asset paths resolve against it.
    pub origin: Url,

    /// Assets precached on install, in order.
    pub static_assets: Vec<String>,

    /// Page served for navigations while offline.
    pub offline_page: String,

    /// Background sync tag that triggers queue replay.
    pub sync_tag: String,

    /// Periodic sync tag that triggers queue replay.
    pub periodic_sync_tag: String,

    /// Promote a freshly installed worker without waiting.
    pub skip_waiting: bool,

    /// Attach the session bearer token to same-origin requests.
    pub attach_session_token: bool,

    /// Notification presentation.
    pub notification: NotificationDefaults,

    /// Retry policy for queue replay.
    pub replay: ReplayConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationDefaults {
    pub title: String,
    pub icon: Option<String>,
    pub badge: Option<String>,
    /// Vibration pattern in milliseconds (on, off, on, ...).
    pub vibrate: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            version_tag: "tapntrip-v1".to_string(),
            origin: Url::parse("http://localhost:3000/").expect("static origin is valid"),
            static_assets: [
                "/",
                "/index.html",
                "/static/js/bundle.js",
                "/static/css/main.css",
                "/manifest.json",
                "/favicon.ico",
                "/logo192.png",
                "/logo512.png",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            offline_page: "/offline.html".to_string(),
            sync_tag: "sync-bookings".to_string(),
            periodic_sync_tag: "refresh-listings".to_string(),
            skip_waiting: false,
            attach_session_token: true,
            notification: NotificationDefaults::default(),
            replay: ReplayConfig::default(),
        }
    }
}

impl Default for NotificationDefaults {
    fn default() -> Self {
        Self {
            title: "TapNTrip".to_string(),
            icon: Some("/logo192.png".to_string()),
            badge: Some("/logo192.png".to_string()),
            vibrate: vec![100, 50, 100],
        }
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
        }
    }
}

impl ReplayConfig {
    /// Backoff policy used when replaying queued requests.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::with_attempts(self.max_attempts, Duration::from_millis(self.initial_delay_ms))
    }
}

impl ControllerConfig {
    /// Create a config for `origin` with the default asset list.
    pub fn for_origin(version_tag: impl Into<String>, origin: Url) -> Self {
        Self {
            version_tag: version_tag.into(),
            origin,
            ..Default::default()
        }
    }

    /// Parse and validate a JSON config.
    pub fn from_json_str(json: &str) -> Result<Self, ServiceWorkerError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ServiceWorkerError::ConfigError(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ServiceWorkerError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            ServiceWorkerError::ConfigError(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&json)
    }

    /// Check invariants the controller relies on.
    pub fn validate(&self) -> Result<(), ServiceWorkerError> {
        if self.version_tag.trim().is_empty() {
            return Err(ServiceWorkerError::ConfigError(
                "version_tag must not be empty".into(),
            ));
        }
        if !matches!(self.origin.scheme(), "http" | "https") {
            return Err(ServiceWorkerError::ConfigError(format!(
                "origin must be http(s), got {}",
                self.origin
            )));
        }
        if self.sync_tag == self.periodic_sync_tag {
            return Err(ServiceWorkerError::ConfigError(
                "sync_tag and periodic_sync_tag must differ".into(),
            ));
        }
        self.precache_urls()?;
        Ok(())
    }

    /// Resolve a path or URL against the origin.
    pub fn resolve(&self, path: &str) -> Result<Url, ServiceWorkerError> {
        self.origin
            .join(path)
            .map_err(|e| ServiceWorkerError::ConfigError(format!("bad asset '{path}': {e}")))
    }

    /// The offline fallback page URL.
    pub fn offline_page_url(&self) -> Result<Url, ServiceWorkerError> {
        self.resolve(&self.offline_page)
    }

    /// The application root opened on notification click.
    pub fn app_root(&self) -> Url {
        let mut root = self.origin.clone();
        root.set_path("/");
        root.set_query(None);
        root.set_fragment(None);
        root
    }

    /// Static assets plus the offline page, deduplicated, in order.
    pub fn precache_urls(&self) -> Result<Vec<Url>, ServiceWorkerError> {
        let mut urls: Vec<Url> = Vec::with_capacity(self.static_assets.len() + 1);
        let offline = self.offline_page_url()?;
        for asset in &self.static_assets {
            let url = self.resolve(asset)?;
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        if !urls.contains(&offline) {
            urls.push(offline);
        }
        Ok(urls)
    }
}
