//! Lazy, restartable topic subscription.
//!
//! A [`Subscription`] produces [`RawBlockEvent`]s on demand, one block at a
//! time, in ascending height then intra-block order. Every block is closed by
//! a `BlockDone` marker. It can be restarted from any height, which is how
//! both retry-after-disconnect and reorg resync are handled.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{self, Stream};
use tracing::{debug, trace};

use super::config::ChainClientConfig;
use super::error::ChainError;
use super::retry::with_retry;
use super::source::ChainSource;
use crate::types::RawBlockEvent;

/// A subscription to the transactions of one topic.
pub struct Subscription {
    source: Arc<dyn ChainSource>,
    config: ChainClientConfig,
    topic: String,
    next_height: u64,
    pending: VecDeque<RawBlockEvent>,
    known_tip: Option<u64>,
}

impl Subscription {
    /// Creates a subscription starting at `from_height`.
    ///
    /// Nothing is fetched until [`next`](Self::next) is called.
    #[must_use]
    pub fn new(
        source: Arc<dyn ChainSource>,
        config: ChainClientConfig,
        topic: impl Into<String>,
        from_height: u64,
    ) -> Self {
        Self {
            source,
            config,
            topic: topic.into(),
            next_height: from_height,
            pending: VecDeque::new(),
            known_tip: None,
        }
    }

    /// Returns the subscribed topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns the height of the next block to be fetched.
    #[must_use]
    pub const fn next_height(&self) -> u64 {
        self.next_height
    }

    /// Returns the underlying chain source.
    #[must_use]
    pub fn source(&self) -> Arc<dyn ChainSource> {
        Arc::clone(&self.source)
    }

    /// Returns the client configuration.
    #[must_use]
    pub const fn config(&self) -> &ChainClientConfig {
        &self.config
    }

    /// Restarts the subscription at `height`, discarding buffered items.
    pub fn resubscribe(&mut self, height: u64) {
        debug!(topic = %self.topic, height, "resubscribing");
        self.pending.clear();
        self.next_height = height;
        self.known_tip = None;
    }

    /// Returns the next item, waiting at the chain tip if necessary.
    ///
    /// Cancel safe: a block is only buffered once fully fetched.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Disconnected`] once the retry ceiling is hit, or
    /// a permanent error from the source.
    pub async fn next(&mut self) -> Result<RawBlockEvent, ChainError> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Ok(item);
            }
            if !self.fill().await? {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }
    }

    /// Converts the subscription into a stream of items.
    pub fn into_stream(self) -> impl Stream<Item = Result<RawBlockEvent, ChainError>> {
        stream::unfold(self, |mut sub| async move {
            let item = sub.next().await;
            Some((item, sub))
        })
    }

    /// Buffers the next block. Returns false if it is not available yet.
    async fn fill(&mut self) -> Result<bool, ChainError> {
        let height = self.next_height;
        let confirmations = self.config.confirmations;
        let confirmed = |tip: u64| height.saturating_add(confirmations) <= tip;

        if !self.known_tip.is_some_and(confirmed) {
            let source = Arc::clone(&self.source);
            let tip = with_retry(&self.config, height, || source.chain_tip()).await?;
            self.known_tip = Some(tip.height);
            if !confirmed(tip.height) {
                trace!(topic = %self.topic, height, tip = tip.height, "waiting at tip");
                return Ok(false);
            }
        }

        let source = Arc::clone(&self.source);
        let topic = self.topic.clone();
        let block = with_retry(&self.config, height, || source.block(&topic, height)).await?;

        let Some(mut block) = block else {
            self.known_tip = None;
            return Ok(false);
        };

        block.transactions.sort_by_key(|tx| tx.block_index);
        trace!(
            topic = %self.topic,
            height,
            txs = block.transactions.len(),
            "fetched block"
        );
        self.pending.extend(
            block
                .transactions
                .into_iter()
                .filter(|tx| tx.block_height == height)
                .map(RawBlockEvent::Transaction),
        );
        self.pending.push_back(RawBlockEvent::BlockDone(block.header));
        self.next_height = height.saturating_add(1);
        Ok(true)
    }
}
