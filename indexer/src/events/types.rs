//! Types for the event processor.
//!
//! Defines fold outcomes and batch processing results.

use serde::{Deserialize, Serialize};

/// Reason an event was skipped by the fold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// The payload is not a well-formed token operation.
    Decode(String),
    /// The token was already deployed.
    DuplicateDeploy,
}

impl SkipReason {
    /// Returns a short label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::DuplicateDeploy => "duplicate_deploy",
        }
    }
}

/// Result of folding one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FoldOutcome {
    /// The event changed the ledger.
    Applied,
    /// The event was skipped; its sequence still advances the checkpoint.
    Skipped(SkipReason),
}

impl FoldOutcome {
    /// Returns true if the event was applied.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// A retraction met while processing a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retraction {
    /// Sequence of the retract entry.
    pub seq: u64,
    /// Lowest retracted height.
    pub height: u64,
}

/// Result of processing a batch of log entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    /// Number of entries consumed (appends only; a retraction stops the batch).
    pub consumed: usize,

    /// Number of events applied.
    pub applied: usize,

    /// Number of events skipped because they could not be decoded.
    pub decode_skipped: usize,

    /// Number of deploys rejected because the token already existed.
    pub deploys_rejected: usize,

    /// Sequence of the last consumed entry.
    pub last_seq: Option<u64>,

    /// Height of the last consumed event.
    pub last_height: Option<u64>,

    /// Retraction that stopped the batch, not yet consumed.
    pub retraction: Option<Retraction>,
}

impl BatchResult {
    /// Creates an empty result.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the number of skipped events.
    #[must_use]
    pub const fn skipped(&self) -> usize {
        self.decode_skipped + self.deploys_rejected
    }

    /// Returns true if nothing was consumed and no retraction is pending.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.consumed == 0 && self.retraction.is_none()
    }

    pub(crate) fn record(&mut self, seq: u64, height: u64, outcome: &FoldOutcome) {
        self.consumed += 1;
        self.last_seq = Some(seq);
        self.last_height = Some(height);
        match outcome {
            FoldOutcome::Applied => self.applied += 1,
            FoldOutcome::Skipped(SkipReason::Decode(_)) => self.decode_skipped += 1,
            FoldOutcome::Skipped(SkipReason::DuplicateDeploy) => self.deploys_rejected += 1,
        }
    }
}
