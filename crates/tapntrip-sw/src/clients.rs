//! Clients API: the pages a controller can focus, open and claim.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

use crate::ServiceWorkerError;

/// A client (controlled page).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Whether focused.
    pub focused: bool,

    /// Whether controlled by the active worker.
    pub controlled: bool,
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
    All,
}

impl ClientType {
    fn accepts(self, other: ClientType) -> bool {
        self == ClientType::All || self == other
    }
}

/// Window/client management provided by the hosting runtime.
#[async_trait]
pub trait ClientsHost: Send + Sync {
    /// All clients of the given type.
    async fn match_all(&self, client_type: ClientType) -> Vec<Client>;

    /// Open a new window at `url`.
    async fn open_window(&self, url: &Url) -> Result<Client, ServiceWorkerError>;

    /// Focus an existing window client.
    async fn focus(&self, id: &str) -> Result<Client, ServiceWorkerError>;

    /// Take control of all clients; returns how many were claimed.
    async fn claim(&self) -> usize;
}

/// In-memory clients registry.
#[derive(Debug, Default)]
pub struct Clients {
    clients: RwLock<HashMap<String, Client>>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub async fn get(&self, id: &str) -> Option<Client> {
        self.clients.read().await.get(id).cloned()
    }

    /// Add an uncontrolled window client at `url`.
    pub async fn add_window(&self, url: Url) -> Client {
        let client = Client {
            id: next_client_id(),
            url,
            client_type: ClientType::Window,
            focused: false,
            controlled: false,
        };
        self.clients
            .write()
            .await
            .insert(client.id.clone(), client.clone());
        client
    }

    /// Remove a client.
    pub async fn remove(&self, id: &str) -> Option<Client> {
        self.clients.write().await.remove(id)
    }

    /// Number of known clients.
    pub async fn count(&self) -> usize {
        self.clients.read().await.len()
    }
}

#[async_trait]
impl ClientsHost for Clients {
    async fn match_all(&self, client_type: ClientType) -> Vec<Client> {
        let mut matched: Vec<Client> = self
            .clients
            .read()
            .await
            .values()
            .filter(|c| client_type.accepts(c.client_type))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }

    async fn open_window(&self, url: &Url) -> Result<Client, ServiceWorkerError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ServiceWorkerError::StateError(format!(
                "Cannot open window at {url}"
            )));
        }

        let mut clients = self.clients.write().await;
        for other in clients.values_mut() {
            other.focused = false;
        }

        let client = Client {
            id: next_client_id(),
            url: url.clone(),
            client_type: ClientType::Window,
            focused: true,
            controlled: true,
        };
        debug!(client = %client.id, url = %url, "Opened window");
        clients.insert(client.id.clone(), client.clone());
        Ok(client)
    }

    async fn focus(&self, id: &str) -> Result<Client, ServiceWorkerError> {
        let mut clients = self.clients.write().await;
        match clients.get(id) {
            None => return Err(ServiceWorkerError::NotFound(format!("client {id}"))),
            Some(c) if c.client_type != ClientType::Window => {
                return Err(ServiceWorkerError::StateError(
                    "Can only focus window clients".to_string(),
                ))
            }
            Some(_) => {}
        }

        let mut focused = None;
        for client in clients.values_mut() {
            client.focused = client.id == id;
            if client.focused {
                focused = Some(client.clone());
            }
        }
        focused.ok_or_else(|| ServiceWorkerError::NotFound(format!("client {id}")))
    }

    async fn claim(&self) -> usize {
        let mut clients = self.clients.write().await;
        let mut claimed = 0;
        for client in clients.values_mut().filter(|c| !c.controlled) {
            client.controlled = true;
            claimed += 1;
        }
        claimed
    }
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("client-{:06}", COUNTER.fetch_add(1, Ordering::Relaxed))
}
