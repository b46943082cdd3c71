//! Listener error types.

use txoflow_indexer::error::{EXIT_CONFIG, EXIT_CONSISTENCY, EXIT_FATAL};
use txoflow_indexer::{LeaseError, StoreError};
use txoflow_sdk::ChainError;

use crate::config::ConfigError;

/// Errors that stop the listener or force a reconnect.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Upstream chain service failure.
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    /// Durable store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Lease failure.
    #[error(transparent)]
    Lease(#[from] LeaseError),

    /// The fork point lies below the retained block window.
    #[error("reorg at height {height} is deeper than the retained window starting at {floor}")]
    ReorgTooDeep {
        /// Height where the divergence was detected.
        height: u64,
        /// Lowest retained height.
        floor: u64,
    },

    /// The log head moved under this writer.
    #[error("log head moved: expected {expected}, found {actual}")]
    HeadMoved {
        /// Head this writer expected.
        expected: u64,
        /// Head found in the store.
        actual: u64,
    },
}

impl ListenerError {
    /// Returns true if resubscribing from durable state may recover.
    #[must_use]
    pub fn is_reconnectable(&self) -> bool {
        match self {
            Self::Chain(e) => e.is_disconnect() || e.is_transient(),
            Self::Store(e) => e.is_transient(),
            Self::Lease(e) => e.is_transient(),
            Self::Config(_) | Self::ReorgTooDeep { .. } | Self::HeadMoved { .. } => false,
        }
    }

    /// Returns the process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::Chain(ChainError::InvalidConfig(_)) => EXIT_CONFIG,
            Self::ReorgTooDeep { .. } | Self::HeadMoved { .. } => EXIT_CONSISTENCY,
            Self::Chain(_) | Self::Store(_) | Self::Lease(_) => EXIT_FATAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            ListenerError::from(ConfigError::EmptyTopic).exit_code(),
            EXIT_CONFIG
        );
        assert_eq!(
            ListenerError::ReorgTooDeep {
                height: 5,
                floor: 8
            }
            .exit_code(),
            EXIT_CONSISTENCY
        );
        assert_eq!(ListenerError::from(ChainError::Timeout).exit_code(), EXIT_FATAL);
        assert_eq!(
            ListenerError::from(ChainError::InvalidConfig("url".to_string())).exit_code(),
            EXIT_CONFIG
        );
    }

    #[test]
    fn test_reconnectable() {
        let disconnected = ChainError::Disconnected {
            height: 1,
            attempts: 6,
            last_error: "timeout".to_string(),
        };
        assert!(ListenerError::from(disconnected).is_reconnectable());
        assert!(ListenerError::from(StoreError::Timeout).is_reconnectable());
        assert!(!ListenerError::from(ChainError::NotFound("x".to_string())).is_reconnectable());
        assert!(!ListenerError::HeadMoved {
            expected: 1,
            actual: 2
        }
        .is_reconnectable());
    }
}
