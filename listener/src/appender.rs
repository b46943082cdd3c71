//! Durable appends for the listener.
//!
//! Sends block and retraction batches to the durable store with retries.
//! Each batch names the head it was built on, so a second writer or a
//! stale view of the log is rejected instead of creating a gap.

use std::sync::Arc;

use tracing::{debug, info, warn};
use txoflow_indexer::{AppendBatch, DurableStore, StoreError};
use txoflow_sdk::{BlockHeader, Event, LogEntry};

use super::config::ListenerConfig;
use super::error::ListenerError;
use super::metrics::ListenerMetrics;

/// Appends log entries for one topic.
pub struct Appender {
    /// Durable store.
    store: Arc<dyn DurableStore>,

    /// Configuration.
    config: ListenerConfig,

    /// Metrics.
    metrics: Arc<ListenerMetrics>,

    /// Log head as last observed.
    head: u64,
}

impl Appender {
    /// Creates an appender. Call [`open`](Self::open) before appending.
    #[must_use]
    pub fn new(
        store: Arc<dyn DurableStore>,
        config: ListenerConfig,
        metrics: Arc<ListenerMetrics>,
    ) -> Self {
        Self {
            store,
            config,
            metrics,
            head: 0,
        }
    }

    /// Loads the current log head.
    ///
    /// # Errors
    ///
    /// Returns store failures.
    pub async fn open(&mut self) -> Result<u64, ListenerError> {
        self.head = self.store.head_seq(&self.config.topic).await?;
        debug!(topic = %self.config.topic, head = self.head, "log head loaded");
        Ok(self.head)
    }

    /// Returns the log head as last observed.
    #[must_use]
    pub const fn head(&self) -> u64 {
        self.head
    }

    /// Builds the batch for a block, numbering its events after the head.
    #[must_use]
    pub fn block_batch(&self, header: &BlockHeader, events: Vec<Event>) -> AppendBatch {
        let mut batch = AppendBatch::new(self.head);
        batch.entries = (self.head + 1..)
            .zip(events)
            .map(|(seq, event)| LogEntry::append(seq, event))
            .collect();
        batch.block = Some((header.height, header.hash.clone()));
        batch.prune_blocks_below = Some(self.config.window_floor(header.height));
        batch.provisional_height = Some(header.height);
        batch
    }

    /// Builds the batch retracting everything at or above `height`.
    #[must_use]
    pub fn retract_batch(&self, height: u64, block_hash: Option<String>) -> AppendBatch {
        let mut batch = AppendBatch::new(self.head);
        batch
            .entries
            .push(LogEntry::retract(self.head + 1, height, block_hash));
        batch.drop_blocks_from = Some(height);
        batch.provisional_height = Some(height.saturating_sub(1));
        batch
    }

    /// Appends one block with its events.
    ///
    /// # Errors
    ///
    /// Returns the store error once retries are exhausted, or
    /// [`ListenerError::HeadMoved`] if another writer advanced the log.
    pub async fn append_block(
        &mut self,
        header: &BlockHeader,
        events: Vec<Event>,
    ) -> Result<u64, ListenerError> {
        let batch = self.block_batch(header, events);
        let count = batch.entries.len();
        let head = self.submit(&batch).await?;
        self.metrics.record_block(header.height, count);
        debug!(height = header.height, events = count, head, "block appended");
        Ok(head)
    }

    /// Appends a retraction of every event at or above `height`.
    ///
    /// # Errors
    ///
    /// Same as [`append_block`](Self::append_block).
    pub async fn retract(
        &mut self,
        height: u64,
        block_hash: Option<String>,
    ) -> Result<u64, ListenerError> {
        let batch = self.retract_batch(height, block_hash);
        let head = self.submit(&batch).await?;
        self.metrics.record_retraction(height);
        info!(topic = %self.config.topic, height, seq = head, "retraction appended");
        Ok(head)
    }

    /// Submits a batch with exponential backoff on transient failures.
    async fn submit(&mut self, batch: &AppendBatch) -> Result<u64, ListenerError> {
        let mut retries = 0u32;
        let mut uncertain = false;

        loop {
            match self.store.append(&self.config.topic, batch).await {
                Ok(head) => {
                    self.head = head;
                    return Ok(head);
                }
                Err(StoreError::HeadMismatch { expected, actual }) => {
                    if uncertain && actual == batch.next_head() && self.landed(batch).await? {
                        debug!(head = actual, "earlier attempt was applied");
                        self.head = actual;
                        return Ok(actual);
                    }
                    return Err(ListenerError::HeadMoved { expected, actual });
                }
                Err(e) if e.is_transient() && retries < self.config.max_retries => {
                    self.metrics.record_append_failure();
                    let wait = self.config.backoff(retries);
                    retries += 1;
                    uncertain = true;
                    warn!(
                        retry = retries,
                        wait_ms = wait.as_millis() as u64,
                        "append failed: {}",
                        e
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    self.metrics.record_append_failure();
                    return Err(e.into());
                }
            }
        }
    }

    /// Returns true if the log already holds exactly this batch.
    async fn landed(&self, batch: &AppendBatch) -> Result<bool, ListenerError> {
        let stored = self
            .store
            .read_log(&self.config.topic, batch.expected_head, batch.entries.len())
            .await?;
        Ok(stored == batch.entries)
    }
}
