//! Session token storage with expiry.
//!
//! The application writes tokens; the offline controller only reads them
//! through [`TokenSource`].

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::debug;

/// A bearer token with an absolute expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl SessionToken {
    /// Whether the token is past its expiry at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Read-only access to the current bearer token.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// The current token, or `None` if absent or expired.
    async fn bearer_token(&self) -> Option<String>;
}

/// In-memory session token store.
#[derive(Debug, Default)]
pub struct TokenStore {
    current: RwLock<Option<SessionToken>>,
}

impl TokenStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a token valid for `ttl` from now.
    pub async fn set(&self, token: impl Into<String>, ttl: Duration) {
        self.set_with_expiry(token, Utc::now() + ttl).await;
    }

    /// Store a token with an explicit expiry.
    pub async fn set_with_expiry(&self, token: impl Into<String>, expires_at: DateTime<Utc>) {
        *self.current.write().await = Some(SessionToken {
            token: token.into(),
            expires_at,
        });
    }

    /// Get the current token. Expired tokens are dropped on read.
    pub async fn get(&self) -> Option<SessionToken> {
        let now = Utc::now();
        {
            let current = self.current.read().await;
            match current.as_ref() {
                None => return None,
                Some(token) if !token.is_expired_at(now) => return Some(token.clone()),
                Some(_) => {}
            }
        }

        let mut current = self.current.write().await;
        if current.as_ref().is_some_and(|t| t.is_expired_at(now)) {
            debug!("Session token expired, clearing");
            *current = None;
        }
        current.clone()
    }

    /// Remove any stored token.
    pub async fn clear(&self) {
        *self.current.write().await = None;
    }
}

#[async_trait]
impl TokenSource for TokenStore {
    async fn bearer_token(&self) -> Option<String> {
        self.get().await.map(|t| t.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_get() {
        let store = TokenStore::new();
        store.set("abc", Duration::hours(1)).await;

        let token = store.get().await.unwrap();
        assert_eq!(token.token, "abc");
        assert_eq!(store.bearer_token().await.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_expired_token_is_cleared() {
        let store = TokenStore::new();
        store
            .set_with_expiry("old", Utc::now() - Duration::seconds(5))
            .await;

        assert!(store.get().await.is_none());
        assert!(store.current.read().await.is_none());
    }

    #[tokio::test]
    async fn test_clear() {
        let store = TokenStore::new();
        store.set("abc", Duration::minutes(5)).await;
        store.clear().await;
        assert!(store.bearer_token().await.is_none());
    }
}
