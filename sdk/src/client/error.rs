//! Chain client error types.
//!
//! Provides error types for chain data service operations.

use std::fmt;

/// Chain client errors.
#[derive(Debug)]
pub enum ChainError {
    /// HTTP request failed.
    Request(reqwest::Error),

    /// Failed to deserialize response.
    Deserialization(String),

    /// Service returned an unexpected status.
    Status {
        /// HTTP status code.
        code: u16,
        /// Response body.
        message: String,
    },

    /// Rate limited (429).
    RateLimited {
        /// Retry after seconds.
        retry_after: Option<u64>,
    },

    /// Resource not found (404).
    NotFound(String),

    /// Invalid configuration.
    InvalidConfig(String),

    /// Request timeout.
    Timeout,

    /// Retries exhausted; the subscription must be re-established.
    Disconnected {
        /// Height the subscription was reading.
        height: u64,
        /// Attempts made.
        attempts: u32,
        /// Last error seen.
        last_error: String,
    },
}

impl ChainError {
    /// Returns true if the error is worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(_) | Self::Timeout | Self::RateLimited { .. } => true,
            Self::Status { code, .. } => *code >= 500,
            Self::Deserialization(_)
            | Self::NotFound(_)
            | Self::InvalidConfig(_)
            | Self::Disconnected { .. } => false,
        }
    }

    /// Returns true if the subscription gave up after its retry ceiling.
    #[must_use]
    pub const fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected { .. })
    }
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(e) => write!(f, "HTTP request failed: {}", e),
            Self::Deserialization(msg) => write!(f, "deserialization failed: {}", msg),
            Self::Status { code, message } => write!(f, "chain service error [{}]: {}", code, message),
            Self::RateLimited { retry_after } => {
                if let Some(secs) = retry_after {
                    write!(f, "rate limited, retry after {} seconds", secs)
                } else {
                    write!(f, "rate limited")
                }
            }
            Self::NotFound(resource) => write!(f, "not found: {}", resource),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            Self::Timeout => write!(f, "request timeout"),
            Self::Disconnected {
                height,
                attempts,
                last_error,
            } => write!(
                f,
                "disconnected at height {} after {} attempts: {}",
                height, attempts, last_error
            ),
        }
    }
}

impl std::error::Error for ChainError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Request(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ChainError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Request(err)
        }
    }
}
