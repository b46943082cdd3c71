//! Listener configuration.
//!
//! Provides configuration options for the listener service.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use txoflow_indexer::config::{backoff_ms, validate_topic, DEFAULT_START_HEIGHT};

pub use txoflow_indexer::config::ConfigError;

/// Default indexer id.
pub const DEFAULT_INDEXER_ID: &str = "bsv21";

/// Default number of block hashes kept for fork detection.
pub const DEFAULT_BLOCK_WINDOW: u64 = 100;

/// Configuration for the listener service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Indexer id, used to name this writer in leases and logs.
    pub indexer_id: String,

    /// Topic to follow and append to.
    pub topic: String,

    /// Height the log starts at.
    pub start_height: u64,

    /// Maximum lite-mode transactions fetched concurrently.
    pub batch_size: usize,

    /// Number of recent block hashes retained for fork detection.
    pub block_window: u64,

    /// Lease time to live in milliseconds.
    pub lease_ttl_ms: u64,

    /// Lease owner id.
    pub owner: String,

    /// Maximum retries for a failed durable append.
    pub max_retries: u32,

    /// Maximum consecutive reconnects without progress.
    pub max_reconnects: u32,

    /// Initial backoff in milliseconds.
    pub initial_backoff_ms: u64,

    /// Backoff multiplier for retries.
    pub backoff_multiplier: f64,

    /// Maximum backoff in milliseconds.
    pub max_backoff_ms: u64,

    /// Interval between progress reports, in seconds.
    pub progress_interval_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            indexer_id: DEFAULT_INDEXER_ID.to_string(),
            topic: String::new(),
            start_height: DEFAULT_START_HEIGHT,
            batch_size: 100,
            block_window: DEFAULT_BLOCK_WINDOW,
            lease_ttl_ms: 30_000,
            owner: format!("{}-{}", DEFAULT_INDEXER_ID, std::process::id()),
            max_retries: 5,
            max_reconnects: 5,
            initial_backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 10_000,
            progress_interval_secs: 10,
        }
    }
}

impl ListenerConfig {
    /// Creates a new configuration for the given topic.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }

    /// Sets the indexer id and derives the lease owner from it.
    #[must_use]
    pub fn with_indexer_id(mut self, id: impl Into<String>) -> Self {
        self.indexer_id = id.into();
        self.owner = format!("{}-{}", self.indexer_id, std::process::id());
        self
    }

    /// Sets the start height.
    #[must_use]
    pub fn with_start_height(mut self, height: u64) -> Self {
        self.start_height = height;
        self
    }

    /// Sets the lite-mode fetch concurrency.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the retained block window.
    #[must_use]
    pub fn with_block_window(mut self, window: u64) -> Self {
        self.block_window = window;
        self
    }

    /// Sets the lease time to live.
    #[must_use]
    pub fn with_lease_ttl(mut self, ms: u64) -> Self {
        self.lease_ttl_ms = ms;
        self
    }

    /// Sets the lease owner.
    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Sets the maximum append retries.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the maximum consecutive reconnects.
    #[must_use]
    pub fn with_max_reconnects(mut self, reconnects: u32) -> Self {
        self.max_reconnects = reconnects;
        self
    }

    /// Sets the retry backoff.
    #[must_use]
    pub fn with_backoff(mut self, initial_ms: u64, multiplier: f64, max_ms: u64) -> Self {
        self.initial_backoff_ms = initial_ms;
        self.backoff_multiplier = multiplier;
        self.max_backoff_ms = max_ms;
        self
    }

    /// Returns the lease time to live.
    #[must_use]
    pub const fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    /// Returns the progress report interval.
    #[must_use]
    pub const fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }

    /// Returns the period of the housekeeping tick.
    ///
    /// The lease is renewed on every tick, three times per time to live.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        (self.lease_ttl() / 3).min(self.progress_interval())
    }

    /// Returns the backoff before retry number `retry` (0-based).
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        backoff_ms(
            self.initial_backoff_ms,
            self.backoff_multiplier,
            self.max_backoff_ms,
            retry,
        )
    }

    /// Returns the lowest height kept in the window once `height` is recorded.
    #[must_use]
    pub fn window_floor(&self, height: u64) -> u64 {
        height.saturating_sub(self.block_window.saturating_sub(1))
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_topic(&self.topic)?;

        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }

        if self.block_window == 0 {
            return Err(ConfigError::InvalidBlockWindow);
        }

        if self.lease_ttl_ms < 3 {
            return Err(ConfigError::InvalidLeaseTtl);
        }

        if self.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoffMultiplier);
        }

        Ok(())
    }
}
