//! HTTP chain data source.
//!
//! Talks to a JungleBus-style REST service.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use super::config::ChainClientConfig;
use super::error::ChainError;
use super::source::ChainSource;
use crate::types::{BlockHeader, RawBlock, Transaction};

/// HTTP client for the chain data service.
#[derive(Debug, Clone)]
pub struct HttpChainSource {
    config: ChainClientConfig,
    http: reqwest::Client,
}

impl HttpChainSource {
    /// Creates a new source with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be created.
    pub fn new(config: ChainClientConfig) -> Result<Self, ChainError> {
        config.validate()?;

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(ChainError::Request)?;

        Ok(Self { config, http })
    }

    /// Creates a new source with the given base URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, ChainError> {
        Self::new(ChainClientConfig::new(base_url))
    }

    /// Returns the client configuration.
    #[must_use]
    pub fn config(&self) -> &ChainClientConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Makes a single GET request; 404 maps to `None`.
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, ChainError> {
        let resp = self.http.get(self.url(path)).send().await?;
        let status = resp.status();

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            return Err(ChainError::RateLimited { retry_after });
        }

        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ChainError::Status {
                code: status.as_u16(),
                message,
            });
        }

        let body = resp.text().await?;
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| ChainError::Deserialization(e.to_string()))
    }
}

#[async_trait]
impl ChainSource for HttpChainSource {
    async fn chain_tip(&self) -> Result<BlockHeader, ChainError> {
        self.get("/v1/block_header/tip")
            .await?
            .ok_or_else(|| ChainError::NotFound("chain tip".to_string()))
    }

    async fn block_header(&self, height: u64) -> Result<Option<BlockHeader>, ChainError> {
        self.get(&format!("/v1/block_header/get/{}", height)).await
    }

    async fn block(&self, topic: &str, height: u64) -> Result<Option<RawBlock>, ChainError> {
        self.get(&format!("/v1/subscription/{}/block/{}", topic, height))
            .await
    }

    async fn fetch_tx(&self, txid: &str) -> Result<Transaction, ChainError> {
        self.get(&format!("/v1/transaction/get/{}", txid))
            .await?
            .ok_or_else(|| ChainError::NotFound(format!("transaction {}", txid)))
    }
}
