//! Event log types.
//!
//! The per-topic log is a sequence of tagged operations. Every entry, an
//! appended event or a retraction, owns exactly one sequence number.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A normalized on-chain transaction matching the listener's topic.
///
/// Immutable once appended to the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Log sequence number.
    pub seq: u64,
    /// Block height of the transaction.
    pub height: u64,
    /// Position of the transaction inside its block.
    pub idx: u64,
    /// Transaction id (hex).
    pub txid: String,
    /// Topic id the transaction was matched against.
    pub topic: String,
    /// Opaque protocol payload as delivered upstream.
    pub payload: String,
    /// Time the listener observed the transaction.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Returns the `(height, idx)` chain position of the event.
    #[must_use]
    pub const fn position(&self) -> (u64, u64) {
        (self.height, self.idx)
    }
}

/// An operation recorded in the event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogOp {
    /// A new event.
    Append(Event),

    /// Invalidates every earlier appended event at or above `height`.
    Retract {
        /// Lowest diverging block height.
        height: u64,
        /// Hash of the replacing block at `height`, if known.
        block_hash: Option<String>,
    },
}

impl LogOp {
    /// Returns true if this is an append.
    #[must_use]
    pub const fn is_append(&self) -> bool {
        matches!(self, Self::Append(_))
    }

    /// Returns true if this is a retraction.
    #[must_use]
    pub const fn is_retract(&self) -> bool {
        matches!(self, Self::Retract { .. })
    }

    /// Returns the appended event, if any.
    #[must_use]
    pub const fn event(&self) -> Option<&Event> {
        match self {
            Self::Append(event) => Some(event),
            Self::Retract { .. } => None,
        }
    }
}

/// A sequenced log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Sequence number, gapless per topic starting at 1.
    pub seq: u64,
    /// The recorded operation.
    pub op: LogOp,
}

impl LogEntry {
    /// Creates an append entry, stamping the event with `seq`.
    #[must_use]
    pub fn append(seq: u64, mut event: Event) -> Self {
        event.seq = seq;
        Self {
            seq,
            op: LogOp::Append(event),
        }
    }

    /// Creates a retraction entry.
    #[must_use]
    pub fn retract(seq: u64, height: u64, block_hash: Option<String>) -> Self {
        Self {
            seq,
            op: LogOp::Retract { height, block_hash },
        }
    }

    /// Returns the Redis stream id for this entry.
    #[must_use]
    pub fn stream_id(&self) -> String {
        format!("{}-0", self.seq)
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.op {
            LogOp::Append(event) => write!(
                f,
                "#{} append {} @{}:{}",
                self.seq, event.txid, event.height, event.idx
            ),
            LogOp::Retract { height, .. } => write!(f, "#{} retract >= {}", self.seq, height),
        }
    }
}

/// Returns the events that survive the given log prefix.
///
/// Entries must be in sequence order. A retraction drops every previously
/// appended event whose height is at or above the retraction height.
#[must_use]
pub fn surviving_events(entries: &[LogEntry]) -> Vec<Event> {
    let mut events: Vec<Event> = Vec::new();
    for entry in entries {
        match &entry.op {
            LogOp::Append(event) => events.push(event.clone()),
            LogOp::Retract { height, .. } => events.retain(|e| e.height < *height),
        }
    }
    events
}
