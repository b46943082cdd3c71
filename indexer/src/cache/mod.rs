//! Cache store.
//!
//! A rebuildable mirror of the materialized token state for fast reads.
//! The cache is never a source of truth: writes are best effort and a
//! full rewrite from the durable store is always possible.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use txoflow_sdk::TokenState;

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

/// Default number of recently active holders kept per topic.
pub const DEFAULT_RECENT_LIMIT: usize = 100;

/// Cache errors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Could not get a pooled connection.
    #[error("cache pool error: {0}")]
    Pool(String),

    /// Redis command failed.
    #[error("cache redis error: {0}")]
    Redis(String),

    /// A cache command exceeded its timeout.
    #[error("cache command timed out")]
    Timeout,

    /// The cache is unreachable.
    #[error("cache unavailable")]
    Unavailable,

    /// JSON encoding failed.
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Redis URL.
    pub url: String,

    /// Expiry for cached entries; `None` keeps them until overwritten.
    pub ttl: Option<Duration>,

    /// Length of the recent holders list.
    pub recent_limit: usize,

    /// Timeout for a single cache command.
    pub command_timeout: Duration,
}

impl CacheConfig {
    /// Creates a configuration for the given URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ttl: None,
            recent_limit: DEFAULT_RECENT_LIMIT,
            command_timeout: Duration::from_secs(2),
        }
    }

    /// Sets the entry expiry.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Read-optimized mirror of token state.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Writes states through to the cache.
    ///
    /// Zero balances remove the holder's entry.
    async fn put_states(&self, topic: &str, states: &[TokenState]) -> Result<(), CacheError>;

    /// Reads the cached state of a holder.
    async fn get_state(&self, topic: &str, holder: &str)
        -> Result<Option<TokenState>, CacheError>;

    /// Returns recently active holders, most recent first.
    async fn recent_holders(&self, topic: &str) -> Result<Vec<String>, CacheError>;

    /// Drops every cache entry of a topic. Returns the number of keys removed.
    async fn clear(&self, topic: &str) -> Result<u64, CacheError>;
}
