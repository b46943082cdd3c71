//! Indexer configuration.
//!
//! Provides configuration options for the indexer service and helpers shared
//! with the listener.

use std::ffi::OsString;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of log entries read per batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default start height of the log.
pub const DEFAULT_START_HEIGHT: u64 = 811_302;

/// Configuration for the indexer service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// Topic (token id) to index.
    pub topic: String,

    /// Height the log starts at.
    pub start_height: u64,

    /// Maximum log entries folded per commit.
    pub batch_size: usize,

    /// Sleep between polls of an idle log, in milliseconds.
    pub poll_interval_ms: u64,

    /// Lease time to live in milliseconds.
    pub lease_ttl_ms: u64,

    /// Lease owner id.
    pub owner: String,

    /// Maximum consecutive retries of transient store failures.
    pub max_retries: u32,

    /// Initial backoff in milliseconds.
    pub initial_backoff_ms: u64,

    /// Backoff multiplier for retries.
    pub backoff_multiplier: f64,

    /// Maximum backoff in milliseconds.
    pub max_backoff_ms: u64,

    /// Interval between progress reports, in seconds.
    pub report_interval_secs: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            topic: String::new(),
            start_height: DEFAULT_START_HEIGHT,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval_ms: 1_000,
            lease_ttl_ms: 30_000,
            owner: format!("index-{}", std::process::id()),
            max_retries: 5,
            initial_backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 10_000,
            report_interval_secs: 10,
        }
    }
}

impl IndexerConfig {
    /// Creates a new configuration for the given topic.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }

    /// Sets the start height.
    #[must_use]
    pub fn with_start_height(mut self, height: u64) -> Self {
        self.start_height = height;
        self
    }

    /// Sets the batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Sets the lease owner.
    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Sets the maximum retries.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
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

    /// Returns the poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the lease time to live.
    #[must_use]
    pub const fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    /// Returns the progress report interval.
    #[must_use]
    pub const fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
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

        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidPollInterval);
        }

        if self.lease_ttl_ms <= self.poll_interval_ms {
            return Err(ConfigError::InvalidLeaseTtl);
        }

        if self.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoffMultiplier);
        }

        Ok(())
    }
}

/// Computes an exponential backoff in milliseconds, capped at `max_ms`.
#[must_use]
pub fn backoff_ms(initial_ms: u64, multiplier: f64, max_ms: u64, retry: u32) -> Duration {
    let backoff = initial_ms as f64 * multiplier.powi(retry.min(64) as i32);
    Duration::from_millis(backoff.min(max_ms as f64) as u64)
}

/// Checks that a topic can be embedded in store keys.
///
/// # Errors
///
/// Returns an error if the topic is empty or contains `:` or whitespace.
pub fn validate_topic(topic: &str) -> Result<(), ConfigError> {
    if topic.is_empty() {
        return Err(ConfigError::EmptyTopic);
    }
    if topic.contains(':') || topic.chars().any(char::is_whitespace) {
        return Err(ConfigError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

/// Turns a `host:port` address into a Redis URL; full URLs pass through.
///
/// # Errors
///
/// Returns an error if the address is empty.
pub fn redis_url(address: &str) -> Result<String, ConfigError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(ConfigError::InvalidUrl(address.to_string()));
    }
    if address.contains("://") {
        Ok(address.to_string())
    } else {
        Ok(format!("redis://{}", address))
    }
}

/// Rewrites single-dash long options such as `-id=bsv21` to `--id=bsv21`.
///
/// Only names listed in `long_names` with more than one character are
/// rewritten, so short options (`-t=..`, `-v 1`) and values are untouched.
pub fn normalize_args<I, T>(args: I, long_names: &[&str]) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    args.into_iter()
        .map(Into::into)
        .map(|arg| {
            let rewritten = arg.to_str().and_then(|text| {
                let rest = text.strip_prefix('-').filter(|r| !r.starts_with('-'))?;
                let name = rest.split_once('=').map_or(rest, |(name, _)| name);
                (name.chars().count() > 1 && long_names.contains(&name))
                    .then(|| OsString::from(format!("-{}", text)))
            });
            rewritten.unwrap_or(arg)
        })
        .collect()
}

/// Configuration errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Topic is empty.
    #[error("topic must not be empty")]
    EmptyTopic,

    /// Topic cannot be used in store keys.
    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    /// Invalid batch size.
    #[error("batch_size must be > 0")]
    InvalidBatchSize,

    /// Invalid poll interval.
    #[error("poll_interval_ms must be > 0")]
    InvalidPollInterval,

    /// Lease would expire between renewals.
    #[error("lease_ttl_ms must be greater than poll_interval_ms")]
    InvalidLeaseTtl,

    /// Invalid backoff multiplier.
    #[error("backoff_multiplier must be >= 1.0")]
    InvalidBackoffMultiplier,

    /// Invalid service address.
    #[error("invalid address: {0:?}")]
    InvalidUrl(String),

    /// Invalid retained block window.
    #[error("block_window must be > 0")]
    InvalidBlockWindow,
}
