//! The chain data source abstraction.

use async_trait::async_trait;

use super::error::ChainError;
use crate::types::{BlockHeader, RawBlock, Transaction};

/// Read access to the upstream blockchain data service.
///
/// Implementations perform a single attempt per call; retries and backoff
/// are applied by [`with_retry`](super::retry::with_retry) and the
/// [`Subscription`](super::subscription::Subscription).
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Returns the current chain tip.
    async fn chain_tip(&self) -> Result<BlockHeader, ChainError>;

    /// Returns the header at `height`, or `None` if the block does not exist yet.
    async fn block_header(&self, height: u64) -> Result<Option<BlockHeader>, ChainError>;

    /// Returns the block at `height` with the transactions matching `topic`.
    async fn block(&self, topic: &str, height: u64) -> Result<Option<RawBlock>, ChainError>;

    /// Fetches a transaction by id.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::NotFound`] if the service does not know the id.
    async fn fetch_tx(&self, txid: &str) -> Result<Transaction, ChainError>;
}
