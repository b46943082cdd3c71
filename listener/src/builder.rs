//! Event building for the listener.
//!
//! Normalizes matched upstream transactions into log events. Transactions
//! delivered without a body (lite mode) are completed with a fetch by id.

use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::warn;
use txoflow_sdk::client::with_retry;
use txoflow_sdk::{ChainClientConfig, ChainError, ChainSource, Event, RawTransaction};

use super::metrics::ListenerMetrics;

/// Builds log events from upstream transactions.
pub struct EventBuilder {
    /// Upstream source for lite-mode fetches.
    source: Arc<dyn ChainSource>,

    /// Retry settings for fetches.
    client: ChainClientConfig,

    /// Topic stamped on every event.
    topic: String,

    /// Maximum concurrent fetches.
    concurrency: usize,

    /// Metrics.
    metrics: Arc<ListenerMetrics>,
}

impl EventBuilder {
    /// Creates a new event builder.
    #[must_use]
    pub fn new(
        source: Arc<dyn ChainSource>,
        client: ChainClientConfig,
        topic: impl Into<String>,
        concurrency: usize,
        metrics: Arc<ListenerMetrics>,
    ) -> Self {
        Self {
            source,
            client,
            topic: topic.into(),
            concurrency: concurrency.max(1),
            metrics,
        }
    }

    /// Returns the topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Normalizes a transaction with a known payload.
    ///
    /// The sequence is assigned when the event is appended.
    #[must_use]
    pub fn normalize(&self, tx: &RawTransaction, payload: String) -> Event {
        Event {
            seq: 0,
            height: tx.block_height,
            idx: tx.block_index,
            txid: tx.id.clone(),
            topic: self.topic.clone(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Builds the event for one transaction.
    ///
    /// Returns `None` if a lite transaction cannot be fetched or carries no
    /// payload.
    ///
    /// # Errors
    ///
    /// Returns fetch failures other than not-found.
    pub async fn build(&self, tx: RawTransaction) -> Result<Option<Event>, ChainError> {
        if let Some(payload) = tx.payload.clone() {
            return Ok(Some(self.normalize(&tx, payload)));
        }

        let fetched = with_retry(&self.client, tx.block_height, || {
            self.source.fetch_tx(&tx.id)
        })
        .await;

        match fetched {
            Ok(full) => match full.payload {
                Some(payload) => Ok(Some(self.normalize(&tx, payload))),
                None => {
                    warn!(txid = %tx.id, height = tx.block_height, "transaction has no payload, skipping");
                    self.metrics.record_missing_tx();
                    Ok(None)
                }
            },
            Err(ChainError::NotFound(_)) => {
                warn!(txid = %tx.id, height = tx.block_height, "transaction not found, skipping");
                self.metrics.record_missing_tx();
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Builds the events of one block, preserving intra-block order.
    ///
    /// # Errors
    ///
    /// Returns the first fetch failure.
    pub async fn build_block(&self, txs: Vec<RawTransaction>) -> Result<Vec<Event>, ChainError> {
        let built: Vec<Option<Event>> = stream::iter(txs)
            .map(|tx| self.build(tx))
            .buffered(self.concurrency)
            .try_collect()
            .await?;
        Ok(built.into_iter().flatten().collect())
    }
}
