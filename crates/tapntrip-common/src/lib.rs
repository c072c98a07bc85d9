//! # TapNTrip Common
//!
//! Error classification, logging configuration and retry utilities shared by
//! the TapNTrip offline controller crates.

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use retry::{retry_if, RetryConfig};

/// Failure of an outbound request, classified for retry decisions.
#[derive(Error, Debug)]
pub enum TapError {
    /// The request never produced a response.
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The server answered with a non-success status.
    #[error("Server answered {0}")]
    Status(u16),

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Cancelled operation.
    #[error("Operation cancelled")]
    Cancelled,
}

impl TapError {
    /// Create a network error with source.
    pub fn network_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Transport failures, timeouts and 5xx may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            TapError::Network { .. } | TapError::Timeout(_) => true,
            TapError::Status(status) => (500..600).contains(status),
            TapError::Cancelled => false,
        }
    }

    /// Get the error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            TapError::Network { .. } => "network",
            TapError::Status(status) if *status >= 500 => "server",
            TapError::Status(_) => "rejected",
            TapError::Timeout(_) => "timeout",
            TapError::Cancelled => "cancelled",
        }
    }
}
