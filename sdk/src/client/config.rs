//! Chain client configuration.
//!
//! Provides configuration options for the chain data client and the
//! subscriptions built on top of it.

use std::time::Duration;

use super::error::ChainError;

/// Default chain data service URL.
pub const DEFAULT_BASE_URL: &str = "https://junglebus.gorillapool.io";

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default maximum retries before a subscription disconnects.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default delay between tip polls in seconds.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;

/// Chain client configuration.
#[derive(Debug, Clone)]
pub struct ChainClientConfig {
    /// Base URL of the chain data service.
    pub base_url: String,

    /// Request timeout.
    pub timeout: Duration,

    /// Maximum number of retries for transient failures.
    pub max_retries: u32,

    /// Initial backoff.
    pub initial_backoff: Duration,

    /// Backoff multiplier.
    pub backoff_multiplier: f64,

    /// Maximum backoff.
    pub max_backoff: Duration,

    /// Delay between polls once the subscription reaches the tip.
    pub poll_interval: Duration,

    /// Blocks that must sit on top of a block before it is streamed.
    pub confirmations: u64,

    /// User agent string.
    pub user_agent: String,
}

impl Default for ChainClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(10),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            confirmations: 0,
            user_agent: format!("txoflow/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ChainClientConfig {
    /// Creates a new configuration with the given base URL.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the maximum number of retries.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the backoff schedule.
    #[must_use]
    pub fn with_backoff(mut self, initial: Duration, multiplier: f64, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.backoff_multiplier = multiplier;
        self.max_backoff = max;
        self
    }

    /// Sets the tip poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Sets the confirmation depth.
    #[must_use]
    pub fn with_confirmations(mut self, confirmations: u64) -> Self {
        self.confirmations = confirmations;
        self
    }

    /// Returns the backoff to wait before the given retry (0-based).
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let millis =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let max = self.max_backoff.as_millis() as f64;
        Duration::from_millis(millis.min(max) as u64)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.base_url.is_empty() {
            return Err(ChainError::InvalidConfig(
                "base_url cannot be empty".to_string(),
            ));
        }

        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(ChainError::InvalidConfig(
                "base_url must start with http:// or https://".to_string(),
            ));
        }

        if self.timeout.is_zero() {
            return Err(ChainError::InvalidConfig(
                "timeout must be > 0".to_string(),
            ));
        }

        if self.backoff_multiplier < 1.0 {
            return Err(ChainError::InvalidConfig(
                "backoff_multiplier must be >= 1.0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ChainClientConfig::default();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.confirmations, 0);
    }

    #[test]
    fn test_config_builder() {
        let config = ChainClientConfig::new("https://chain.example.com")
            .with_timeout(Duration::from_secs(5))
            .with_max_retries(2)
            .with_poll_interval(Duration::from_secs(1))
            .with_confirmations(5);

        assert_eq!(config.base_url, "https://chain.example.com");
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.confirmations, 5);
    }

    #[test]
    fn test_config_backoff() {
        let config = ChainClientConfig::default().with_backoff(
            Duration::from_millis(100),
            2.0,
            Duration::from_millis(1000),
        );

        assert_eq!(config.backoff(0), Duration::from_millis(100));
        assert_eq!(config.backoff(1), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(800));
        // Capped at max
        assert_eq!(config.backoff(4), Duration::from_millis(1000));
        assert_eq!(config.backoff(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_config_validate() {
        assert!(ChainClientConfig::new("https://chain.example.com")
            .validate()
            .is_ok());
        assert!(ChainClientConfig::new("").validate().is_err());
        assert!(ChainClientConfig::new("ftp://chain.example.com")
            .validate()
            .is_err());

        let config = ChainClientConfig::default().with_backoff(
            Duration::from_millis(1),
            0.5,
            Duration::from_millis(1),
        );
        assert!(config.validate().is_err());
    }
}
