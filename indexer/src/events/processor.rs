//! Event processor implementation.
//!
//! Folds a batch of log entries into a ledger overlay. The processor is
//! synchronous and does no I/O: the caller loads the holders a batch
//! touches, runs [`EventProcessor::process`], and commits the changes.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};
use txoflow_sdk::{LogEntry, LogOp, TokenOp};

use super::metrics::IndexerMetrics;
use super::types::{BatchResult, FoldOutcome, Retraction, SkipReason};
use crate::ledger::{ConsistencyError, Ledger};

/// Event processor for folding log entries into token state.
///
/// # Example
///
/// ```rust,ignore
/// use txoflow_indexer::events::EventProcessor;
/// use txoflow_indexer::ledger::Ledger;
///
/// let processor = EventProcessor::new();
/// let mut ledger = Ledger::new("bsv21");
/// let result = processor.process(&mut ledger, 0, &entries)?;
/// println!("Applied {} events", result.applied);
/// ```
pub struct EventProcessor {
    /// Metrics for monitoring.
    metrics: Arc<IndexerMetrics>,
}

impl Default for EventProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl EventProcessor {
    /// Creates a new event processor.
    #[must_use]
    pub fn new() -> Self {
        Self::with_metrics(Arc::new(IndexerMetrics::new()))
    }

    /// Creates a processor sharing the given metrics.
    #[must_use]
    pub fn with_metrics(metrics: Arc<IndexerMetrics>) -> Self {
        Self { metrics }
    }

    /// Returns a reference to the metrics.
    #[must_use]
    pub fn metrics(&self) -> Arc<IndexerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Returns the holders referenced by the appends before the first retraction.
    ///
    /// Undecodable payloads reference nobody.
    #[must_use]
    pub fn touched_holders(entries: &[LogEntry]) -> BTreeSet<String> {
        let mut holders = BTreeSet::new();
        for entry in entries {
            let event = match &entry.op {
                LogOp::Append(event) => event,
                LogOp::Retract { .. } => break,
            };
            match TokenOp::decode(&event.payload) {
                Ok(TokenOp::DeployMint { to, .. }) => {
                    holders.insert(to);
                }
                Ok(TokenOp::Transfer { from, to, .. }) => {
                    holders.insert(from);
                    holders.insert(to);
                }
                Ok(TokenOp::Burn { from, .. }) => {
                    holders.insert(from);
                }
                Err(_) => {}
            }
        }
        holders
    }

    /// Processes a batch of log entries following `after_seq`.
    ///
    /// Appends are folded in order until the first retraction, which is
    /// reported in [`BatchResult::retraction`] and left unconsumed.
    ///
    /// # Errors
    ///
    /// Returns a [`ConsistencyError`] on a sequence gap or a fold violation.
    /// The ledger may hold partial changes in that case and must be dropped.
    pub fn process(
        &self,
        ledger: &mut Ledger,
        after_seq: u64,
        entries: &[LogEntry],
    ) -> Result<BatchResult, ConsistencyError> {
        let start = Instant::now();
        let mut result = BatchResult::empty();
        let mut expected = after_seq;

        for entry in entries {
            expected = expected.saturating_add(1);
            if entry.seq != expected {
                return Err(ConsistencyError::Gap {
                    expected,
                    found: entry.seq,
                });
            }

            match &entry.op {
                LogOp::Append(event) => {
                    let outcome = ledger.apply(event)?;
                    if let FoldOutcome::Skipped(reason) = &outcome {
                        match reason {
                            SkipReason::Decode(e) => {
                                warn!(seq = entry.seq, txid = %event.txid, "skipping event: {}", e);
                            }
                            SkipReason::DuplicateDeploy => {
                                warn!(seq = entry.seq, txid = %event.txid, "rejecting repeated deploy");
                            }
                        }
                    }
                    result.record(entry.seq, event.height, &outcome);
                }
                LogOp::Retract { height, .. } => {
                    debug!(seq = entry.seq, height, "retraction reached");
                    result.retraction = Some(Retraction {
                        seq: entry.seq,
                        height: *height,
                    });
                    break;
                }
            }
        }

        self.metrics.record_batch(&result, start.elapsed());
        Ok(result)
    }
}
