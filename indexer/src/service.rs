//! Main indexer service.
//!
//! Consumes the event log of one topic in sequence order, folds it into
//! token state and commits state plus checkpoint atomically. The cache is
//! written through after each commit on a best effort basis.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};
use txoflow_sdk::{surviving_events, Checkpoint, LogEntry, TokenState};

use crate::cache::CacheStore;
use crate::config::{ConfigError, IndexerConfig};
use crate::error::IndexerError;
use crate::events::{EventProcessor, IndexerMetrics, Retraction};
use crate::ledger::{self, ConsistencyError, Ledger};
use crate::lease::{Lease, LeaseError};
use crate::store::{Commit, DurableStore, StoreError};

/// Lease role of the indexer.
pub const LEASE_ROLE: &str = "index";

/// Result of one poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOutcome {
    /// Checkpoint after the cycle.
    pub checkpoint: Checkpoint,

    /// Log entries consumed, retractions included.
    pub consumed: usize,
}

/// The indexer service.
pub struct IndexerService {
    /// Configuration.
    config: IndexerConfig,

    /// Durable store.
    store: Arc<dyn DurableStore>,

    /// Cache store.
    cache: Arc<dyn CacheStore>,

    /// Batch processor.
    processor: EventProcessor,

    /// Metrics.
    metrics: Arc<IndexerMetrics>,

    /// Single-writer lease.
    lease: Lease,

    /// Whether the service is running.
    running: Arc<AtomicBool>,
}

impl IndexerService {
    /// Creates a new indexer service.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(
        config: IndexerConfig,
        store: Arc<dyn DurableStore>,
        cache: Arc<dyn CacheStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let metrics = Arc::new(IndexerMetrics::new());
        let lease = Lease::new(
            Arc::clone(&store),
            LEASE_ROLE,
            &config.topic,
            config.owner.clone(),
            config.lease_ttl(),
        );

        Ok(Self {
            processor: EventProcessor::with_metrics(Arc::clone(&metrics)),
            metrics,
            lease,
            config,
            store,
            cache,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Returns the metrics.
    #[must_use]
    pub fn metrics(&self) -> Arc<IndexerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &IndexerConfig {
        &self.config
    }

    /// Returns true if the service is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stops the service after the current cycle.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        info!("Indexer stop requested");
    }

    fn topic(&self) -> &str {
        &self.config.topic
    }

    /// Loads the durable checkpoint and checks it against the log head.
    ///
    /// # Errors
    ///
    /// Returns [`ConsistencyError::CheckpointAhead`] if the checkpoint covers
    /// more entries than the log holds.
    pub async fn open(&self) -> Result<Checkpoint, IndexerError> {
        let head = self.store.head_seq(self.topic()).await?;
        let checkpoint = self
            .store
            .load_checkpoint(self.topic())
            .await?
            .unwrap_or_else(|| Checkpoint::genesis(self.topic(), self.config.start_height));

        if checkpoint.last_seq > head {
            return Err(ConsistencyError::CheckpointAhead {
                checkpoint: checkpoint.last_seq,
                head,
            }
            .into());
        }

        info!(
            topic = %self.topic(),
            seq = checkpoint.last_seq,
            height = checkpoint.last_height,
            pending = checkpoint.pending_count(head),
            "resuming from checkpoint"
        );
        Ok(checkpoint)
    }

    /// Runs the indexer until stopped.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that stopped the loop.
    pub async fn run(&self) -> Result<(), IndexerError> {
        self.lease.acquire().await?;
        self.running.store(true, Ordering::Relaxed);
        info!(topic = %self.topic(), "Indexer service started");

        let result = self.run_loop().await;

        self.running.store(false, Ordering::Relaxed);
        self.lease.release().await;
        match &result {
            Ok(()) => info!("Indexer service stopped"),
            Err(e) => error!("Indexer service failed: {}", e),
        }
        result
    }

    async fn run_loop(&self) -> Result<(), IndexerError> {
        let mut checkpoint: Option<Checkpoint> = None;
        let mut retries = 0u32;
        let mut last_report = Instant::now();

        while self.is_running() {
            match self.step(&mut checkpoint).await {
                Ok(consumed) => {
                    retries = 0;
                    if consumed == 0 {
                        tokio::time::sleep(self.config.poll_interval()).await;
                    }
                }
                Err(e) if e.is_transient() && retries < self.config.max_retries => {
                    let wait = self.config.backoff(retries);
                    retries += 1;
                    warn!(retry = retries, wait_ms = wait.as_millis() as u64, "indexer cycle failed: {}", e);
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }

            if last_report.elapsed() >= self.config.report_interval() {
                info!("{}", self.metrics.snapshot());
                last_report = Instant::now();
            }
        }

        Ok(())
    }

    /// One cycle. On error the checkpoint is dropped so the next cycle
    /// reloads it from the durable store.
    async fn step(&self, checkpoint: &mut Option<Checkpoint>) -> Result<usize, IndexerError> {
        self.lease.renew().await?;
        let current = match checkpoint.take() {
            Some(cp) => cp,
            None => self.open().await?,
        };
        let outcome = self.poll_once(&current).await?;
        *checkpoint = Some(outcome.checkpoint);
        Ok(outcome.consumed)
    }

    /// Reads and folds the next batch after `checkpoint`.
    ///
    /// Appends are committed together with the advanced checkpoint. A
    /// retraction in the batch is handled after the appends before it are
    /// committed.
    ///
    /// # Errors
    ///
    /// Returns store failures and consistency violations. Nothing from the
    /// failing commit is persisted.
    pub async fn poll_once(&self, checkpoint: &Checkpoint) -> Result<PollOutcome, IndexerError> {
        let entries = self
            .store
            .read_log(self.topic(), checkpoint.last_seq, self.config.batch_size)
            .await?;
        if entries.is_empty() {
            return Ok(PollOutcome {
                checkpoint: checkpoint.clone(),
                consumed: 0,
            });
        }

        let mut overlay = self.load_overlay(&entries).await?;
        let result = self
            .processor
            .process(&mut overlay, checkpoint.last_seq, &entries)?;

        let mut next = checkpoint.clone();
        if let Some(seq) = result.last_seq {
            next = checkpoint.advanced(seq, result.last_height);
            let (states, token_info) = overlay.take_changes();
            let commit =
                Commit::new(states, token_info, next.clone()).with_lease(self.lease.guard());
            self.commit(&commit).await?;
            debug!(
                seq,
                applied = result.applied,
                skipped = result.skipped(),
                "batch committed"
            );
        }

        let mut consumed = result.consumed;
        if let Some(retraction) = result.retraction {
            next = self.refold(&next, retraction).await?;
            consumed += 1;
        }

        Ok(PollOutcome {
            checkpoint: next,
            consumed,
        })
    }

    /// Loads token metadata and the holders the batch touches.
    async fn load_overlay(&self, entries: &[LogEntry]) -> Result<Ledger, IndexerError> {
        let mut ledger = Ledger::new(self.topic());
        ledger.set_info(self.store.load_token_info(self.topic()).await?);
        for holder in EventProcessor::touched_holders(entries) {
            if let Some(state) = self.store.load_state(self.topic(), &holder).await? {
                ledger.insert(state);
            }
        }
        Ok(ledger)
    }

    async fn commit(&self, commit: &Commit) -> Result<(), IndexerError> {
        if let Err(e) = self.store.commit(commit).await {
            self.metrics.record_commit_failure();
            return Err(commit_failure(e));
        }
        self.metrics.record_commit(commit.checkpoint.last_seq);
        self.write_through(&commit.states).await;
        Ok(())
    }

    async fn write_through(&self, states: &[TokenState]) {
        if states.is_empty() {
            return;
        }
        if let Err(e) = self.cache.put_states(self.topic(), states).await {
            self.metrics.record_cache_failure();
            warn!(holders = states.len(), "cache write-through failed: {}", e);
        }
    }

    /// Replays the log up to a retraction and commits the difference.
    ///
    /// The replay reads every entry from sequence 1, so its cost grows with
    /// the log, not with the depth of the reorg. Only holders whose state
    /// changed or disappeared are written.
    async fn refold(
        &self,
        checkpoint: &Checkpoint,
        retraction: Retraction,
    ) -> Result<Checkpoint, IndexerError> {
        let start = Instant::now();
        let entries = self.read_through(retraction.seq).await?;
        let (ledger, stats) = ledger::replay(self.topic(), &entries)?;
        let previous = self.store.load_states(self.topic()).await?;

        let height = checkpoint
            .last_height
            .min(retraction.height.saturating_sub(1));
        let next = checkpoint.advanced(retraction.seq, Some(height));

        let (changed, removed) = state_diff(&ledger, previous);
        let replace = ledger.info().is_none();
        // Without surviving token metadata the topic is replaced outright.
        let states = if replace {
            ledger.states().cloned().collect()
        } else {
            changed
        };
        let commit = Commit::new(states, ledger.info().cloned(), next.clone())
            .with_removed(removed)
            .with_lease(self.lease.guard());
        let written = if replace {
            self.store.replace_state(&commit).await
        } else {
            self.store.commit(&commit).await
        };
        if let Err(e) = written {
            self.metrics.record_commit_failure();
            return Err(commit_failure(e));
        }
        self.metrics.record_retraction();
        self.metrics.record_commit(retraction.seq);

        let mut touched = commit.states.clone();
        touched.extend(commit.removed.iter().map(|holder| TokenState {
            last_seq: retraction.seq,
            ..TokenState::empty(self.topic(), holder.as_str())
        }));
        self.write_through(&touched).await;

        info!(
            seq = retraction.seq,
            height = retraction.height,
            replayed = entries.len(),
            surviving = stats.surviving,
            changed = commit.states.len(),
            removed = commit.removed.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "state refolded after retraction"
        );
        Ok(next)
    }

    /// Reads log entries `1..=upto`, checking that none is missing.
    async fn read_through(&self, upto: u64) -> Result<Vec<LogEntry>, IndexerError> {
        let mut entries: Vec<LogEntry> = Vec::new();
        let mut after = 0u64;

        while after < upto {
            let page = self
                .store
                .read_log(self.topic(), after, self.config.batch_size)
                .await?;
            let Some(last) = page.last() else { break };
            after = last.seq;
            entries.extend(page.into_iter().take_while(|e| e.seq <= upto));
        }

        for (expected, entry) in (1u64..).zip(entries.iter()) {
            if entry.seq != expected {
                return Err(ConsistencyError::Gap {
                    expected,
                    found: entry.seq,
                }
                .into());
            }
        }
        if (entries.len() as u64) < upto {
            return Err(ConsistencyError::CheckpointAhead {
                checkpoint: upto,
                head: entries.len() as u64,
            }
            .into());
        }
        Ok(entries)
    }

    /// Replays the whole log and replaces all state, then refreshes the cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease is held elsewhere, the store fails, or
    /// the log does not fold consistently.
    pub async fn rebuild(&self) -> Result<Checkpoint, IndexerError> {
        self.lease.acquire().await?;
        let result = self.rebuild_locked().await;
        self.lease.release().await;
        result
    }

    async fn rebuild_locked(&self) -> Result<Checkpoint, IndexerError> {
        let head = self.store.head_seq(self.topic()).await?;
        let entries = self.read_through(head).await?;
        let (ledger, stats) = ledger::replay(self.topic(), &entries)?;

        let last_height = surviving_events(&entries)
            .last()
            .map_or(self.config.start_height, |e| e.height);
        let checkpoint =
            Checkpoint::genesis(self.topic(), self.config.start_height).advanced(head, Some(last_height));
        let commit = Commit::new(
            ledger.states().cloned().collect(),
            ledger.info().cloned(),
            checkpoint.clone(),
        )
        .with_lease(self.lease.guard());
        self.store
            .replace_state(&commit)
            .await
            .map_err(commit_failure)?;
        self.metrics.record_commit(head);

        info!(
            topic = %self.topic(),
            head,
            surviving = stats.surviving,
            applied = stats.applied,
            skipped = stats.skipped,
            holders = commit.states.len(),
            "state rebuilt from log"
        );

        if let Err(e) = self.rebuild_cache().await {
            self.metrics.record_cache_failure();
            warn!("cache refresh after rebuild failed: {}", e);
        }
        Ok(checkpoint)
    }

    /// Rewrites the cache of the topic from durable state.
    ///
    /// # Errors
    ///
    /// Returns an error if either store fails.
    pub async fn rebuild_cache(&self) -> Result<usize, IndexerError> {
        let states = self.store.load_states(self.topic()).await?;
        let removed = self.cache.clear(self.topic()).await?;
        self.cache.put_states(self.topic(), &states).await?;
        info!(
            topic = %self.topic(),
            removed,
            holders = states.len(),
            "cache rebuilt"
        );
        Ok(states.len())
    }
}

/// Splits a replayed ledger against the stored states into the states to
/// write and the holders to delete.
fn state_diff(ledger: &Ledger, previous: Vec<TokenState>) -> (Vec<TokenState>, Vec<String>) {
    let mut stored: HashMap<String, TokenState> = previous
        .into_iter()
        .map(|state| (state.holder.clone(), state))
        .collect();
    let changed = ledger
        .states()
        .filter(|state| stored.remove(&state.holder).as_ref() != Some(*state))
        .cloned()
        .collect();
    let mut removed: Vec<String> = stored.into_keys().collect();
    removed.sort();
    (changed, removed)
}

/// Maps a failed commit, reporting a refused lease as a lost lease.
fn commit_failure(e: StoreError) -> IndexerError {
    match e {
        StoreError::LeaseLost { key } => LeaseError::Lost { key }.into(),
        e => e.into(),
    }
}
