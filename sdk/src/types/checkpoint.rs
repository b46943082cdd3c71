//! Checkpoint for tracking indexing progress.
//!
//! A checkpoint is written by the indexer in the same atomic commit as the
//! state it covers, and read by the listener to choose its resume height.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable progress marker for one topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Topic id.
    pub topic: String,

    /// Height of the last applied event (or the start boundary).
    pub last_height: u64,

    /// Last log sequence number folded into state.
    pub last_seq: u64,

    /// Time the checkpoint was committed.
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Creates the initial checkpoint for a topic, before any event.
    #[must_use]
    pub fn genesis(topic: impl Into<String>, start_height: u64) -> Self {
        Self {
            topic: topic.into(),
            last_height: start_height,
            last_seq: 0,
            updated_at: Utc::now(),
        }
    }

    /// Returns true if the given sequence number has been processed.
    #[must_use]
    pub const fn is_processed(&self, seq: u64) -> bool {
        seq <= self.last_seq
    }

    /// Returns true if the given sequence number should be processed.
    #[must_use]
    pub const fn should_process(&self, seq: u64) -> bool {
        seq > self.last_seq
    }

    /// Returns a checkpoint advanced to `seq`.
    ///
    /// The height only moves when a height is supplied; retractions and
    /// skipped entries carry no height of their own.
    #[must_use]
    pub fn advanced(&self, seq: u64, height: Option<u64>) -> Self {
        Self {
            topic: self.topic.clone(),
            last_height: height.unwrap_or(self.last_height),
            last_seq: seq.max(self.last_seq),
            updated_at: Utc::now(),
        }
    }

    /// Returns the number of log entries not yet processed given the log head.
    #[must_use]
    pub fn pending_count(&self, head_seq: u64) -> u64 {
        head_seq.saturating_sub(self.last_seq)
    }

    /// Returns the height the listener should resume from.
    #[must_use]
    pub fn resume_height(&self, start_height: u64) -> u64 {
        self.last_height.max(start_height)
    }
}
