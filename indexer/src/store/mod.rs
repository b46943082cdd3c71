//! Durable store.
//!
//! The durable store holds the per-topic event log, the listener's block
//! hash window and provisional height, the materialized token state, the
//! indexer checkpoint and the lease locks. Every mutation that must be
//! atomic is a single trait call.
//!
//! # Components
//!
//! - [`DurableStore`]: Storage trait
//! - [`RedisStore`]: Redis implementation
//! - [`MemoryStore`]: In-memory implementation with fault injection
//! - [`keys`]: Redis key schema

pub mod keys;
pub mod memory;
pub mod redis;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use txoflow_sdk::{Checkpoint, LogEntry, TokenInfo, TokenState};

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// An atomic log append.
///
/// Entries must carry the sequences `expected_head + 1 ..= expected_head + n`.
/// The block hash window and the provisional height are updated in the same
/// transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendBatch {
    /// Head the writer observed; the append is rejected if it moved.
    pub expected_head: u64,

    /// Entries to append.
    pub entries: Vec<LogEntry>,

    /// Block hash to record as `(height, hash)`.
    pub block: Option<(u64, String)>,

    /// Forget recorded hashes at or above this height.
    pub drop_blocks_from: Option<u64>,

    /// Forget recorded hashes below this height.
    pub prune_blocks_below: Option<u64>,

    /// New provisional height.
    pub provisional_height: Option<u64>,
}

impl AppendBatch {
    /// Creates an empty batch on top of `expected_head`.
    #[must_use]
    pub fn new(expected_head: u64) -> Self {
        Self {
            expected_head,
            ..Default::default()
        }
    }

    /// Returns the head after this batch is applied.
    #[must_use]
    pub fn next_head(&self) -> u64 {
        self.expected_head.saturating_add(self.entries.len() as u64)
    }

    /// Checks that the entries are contiguous after the expected head.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidBatch`] on a sequence gap.
    pub fn validate(&self) -> Result<(), StoreError> {
        let mut expected = self.expected_head;
        for entry in &self.entries {
            expected = expected.saturating_add(1);
            if entry.seq != expected {
                return Err(StoreError::InvalidBatch(format!(
                    "entry seq {} where {} was expected",
                    entry.seq, expected
                )));
            }
        }
        Ok(())
    }
}

/// Lease a commit is conditional on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGuard {
    /// Lease key.
    pub key: String,

    /// Owner that must still hold the key when the commit lands.
    pub owner: String,
}

/// An atomic state commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Holder states written by this commit.
    pub states: Vec<TokenState>,

    /// Holders whose state records are deleted.
    pub removed: Vec<String>,

    /// Token metadata, if changed (or, for a replacement, if any).
    pub token_info: Option<TokenInfo>,

    /// Checkpoint covering the commit.
    pub checkpoint: Checkpoint,

    /// If set, nothing is written unless this lease is still held.
    pub lease: Option<LeaseGuard>,
}

impl Commit {
    /// Creates a commit of `states` and `checkpoint`.
    #[must_use]
    pub fn new(
        states: Vec<TokenState>,
        token_info: Option<TokenInfo>,
        checkpoint: Checkpoint,
    ) -> Self {
        Self {
            states,
            removed: Vec::new(),
            token_info,
            checkpoint,
            lease: None,
        }
    }

    /// Creates a commit that only advances the checkpoint.
    #[must_use]
    pub fn checkpoint_only(checkpoint: Checkpoint) -> Self {
        Self::new(Vec::new(), None, checkpoint)
    }

    /// Sets the holders to delete.
    #[must_use]
    pub fn with_removed(mut self, removed: Vec<String>) -> Self {
        self.removed = removed;
        self
    }

    /// Makes the commit conditional on `lease`.
    #[must_use]
    pub fn with_lease(mut self, lease: Option<LeaseGuard>) -> Self {
        self.lease = lease;
        self
    }

    /// Returns the committed topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.checkpoint.topic
    }
}

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Redis command failed.
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// A store command exceeded its timeout.
    #[error("store command timed out")]
    Timeout,

    /// The store is unreachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The log head moved under the writer.
    #[error("log head mismatch: expected {expected}, found {actual}")]
    HeadMismatch {
        /// Head the writer expected.
        expected: u64,
        /// Head found in the store.
        actual: u64,
    },

    /// The append batch is malformed.
    #[error("invalid append batch: {0}")]
    InvalidBatch(String),

    /// A stored record could not be decoded.
    #[error("corrupt record at {key}: {reason}")]
    Corrupt {
        /// Offending key.
        key: String,
        /// Decode failure.
        reason: String,
    },

    /// JSON encoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The lease guarding a commit is no longer held by the writer.
    #[error("lease {key} is no longer held by this writer")]
    LeaseLost {
        /// Lease key.
        key: String,
    },
}

impl StoreError {
    /// Returns true if retrying the operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Redis(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            Self::Timeout | Self::Unavailable(_) => true,
            Self::HeadMismatch { .. }
            | Self::InvalidBatch(_)
            | Self::Corrupt { .. }
            | Self::Serialization(_)
            | Self::LeaseLost { .. } => false,
        }
    }

    pub(crate) fn corrupt(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::Corrupt {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

/// Durable storage for the event log, token state and coordination keys.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Returns the log head (0 for an empty log).
    async fn head_seq(&self, topic: &str) -> Result<u64, StoreError>;

    /// Appends a batch atomically and returns the new head.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::HeadMismatch`] if the head differs from
    /// `batch.expected_head`; nothing is written in that case.
    async fn append(&self, topic: &str, batch: &AppendBatch) -> Result<u64, StoreError>;

    /// Reads up to `limit` entries with sequence greater than `after_seq`.
    async fn read_log(
        &self,
        topic: &str,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, StoreError>;

    /// Returns the retained block hash window.
    async fn block_hashes(&self, topic: &str) -> Result<BTreeMap<u64, String>, StoreError>;

    /// Returns the provisional height, if the listener has appended anything.
    async fn provisional_height(&self, topic: &str) -> Result<Option<u64>, StoreError>;

    /// Loads the checkpoint.
    async fn load_checkpoint(&self, topic: &str) -> Result<Option<Checkpoint>, StoreError>;

    /// Loads the state of one holder.
    async fn load_state(&self, topic: &str, holder: &str)
        -> Result<Option<TokenState>, StoreError>;

    /// Loads every holder state of a topic, ordered by holder.
    async fn load_states(&self, topic: &str) -> Result<Vec<TokenState>, StoreError>;

    /// Loads the token metadata.
    async fn load_token_info(&self, topic: &str) -> Result<Option<TokenInfo>, StoreError>;

    /// Writes states, removals, token metadata and checkpoint in one
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LeaseLost`] if `commit.lease` is set and no
    /// longer held by its owner; nothing is written in that case.
    async fn commit(&self, commit: &Commit) -> Result<(), StoreError>;

    /// Replaces all state of the topic in one transaction.
    ///
    /// Holders absent from `commit.states` are removed, as is the token
    /// metadata when `commit.token_info` is `None`. The lease check is the
    /// same as for [`DurableStore::commit`].
    async fn replace_state(&self, commit: &Commit) -> Result<(), StoreError>;

    /// Takes the lease at `key` if free. Returns false if another owner holds it.
    async fn acquire_lease(&self, key: &str, owner: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Extends the lease if still held by `owner`.
    async fn renew_lease(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Releases the lease if still held by `owner`.
    async fn release_lease(&self, key: &str, owner: &str) -> Result<bool, StoreError>;
}
