//! Indexer error types and process exit codes.

use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::ledger::ConsistencyError;
use crate::lease::LeaseError;
use crate::store::StoreError;

/// Exit code for a clean shutdown.
pub const EXIT_OK: u8 = 0;

/// Exit code for a fatal upstream or store failure.
pub const EXIT_FATAL: u8 = 1;

/// Exit code for a data-consistency violation or a reorg beyond retention.
pub const EXIT_CONSISTENCY: u8 = 2;

/// Exit code for a configuration error.
pub const EXIT_CONFIG: u8 = 3;

/// Errors that stop the indexer.
#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Durable store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Cache failure on an explicit cache operation.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Data-consistency violation.
    #[error("data consistency violation: {0}")]
    Consistency(#[from] ConsistencyError),

    /// Lease failure.
    #[error(transparent)]
    Lease(#[from] LeaseError),
}

impl IndexerError {
    /// Returns true if retrying may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Lease(e) => e.is_transient(),
            Self::Config(_) | Self::Cache(_) | Self::Consistency(_) => false,
        }
    }

    /// Returns the process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => EXIT_CONFIG,
            Self::Consistency(_) => EXIT_CONSISTENCY,
            Self::Store(_) | Self::Cache(_) | Self::Lease(_) => EXIT_FATAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            IndexerError::from(ConfigError::EmptyTopic).exit_code(),
            EXIT_CONFIG
        );
        assert_eq!(
            IndexerError::from(ConsistencyError::Gap {
                expected: 1,
                found: 2
            })
            .exit_code(),
            EXIT_CONSISTENCY
        );
        assert_eq!(IndexerError::from(StoreError::Timeout).exit_code(), EXIT_FATAL);
    }

    #[test]
    fn test_transient() {
        assert!(IndexerError::from(StoreError::Timeout).is_transient());
        assert!(!IndexerError::from(CacheError::Unavailable).is_transient());
        assert!(!IndexerError::from(LeaseError::Lost {
            key: "k".to_string()
        })
        .is_transient());
    }
}
