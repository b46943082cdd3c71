//! Metrics tracking for the indexer.
//!
//! Provides atomic counters for monitoring log consumption and commits.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::types::BatchResult;

/// Metrics for the indexer.
#[derive(Debug)]
pub struct IndexerMetrics {
    /// Log entries consumed (appends and retractions).
    entries_consumed: AtomicU64,

    /// Events applied to the ledger.
    events_applied: AtomicU64,

    /// Events skipped because the payload did not decode.
    decode_skipped: AtomicU64,

    /// Repeated deploys rejected.
    deploys_rejected: AtomicU64,

    /// Retractions handled.
    retractions: AtomicU64,

    /// Successful durable commits.
    commits: AtomicU64,

    /// Failed durable commits.
    commit_failures: AtomicU64,

    /// Failed cache writes.
    cache_failures: AtomicU64,

    /// Last committed sequence.
    last_seq: AtomicU64,

    /// Total processing time in nanoseconds.
    total_processing_time_ns: AtomicU64,

    /// Start time for rate calculation.
    start_time: Instant,
}

impl Default for IndexerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexerMetrics {
    /// Creates a new metrics instance.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries_consumed: AtomicU64::new(0),
            events_applied: AtomicU64::new(0),
            decode_skipped: AtomicU64::new(0),
            deploys_rejected: AtomicU64::new(0),
            retractions: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            commit_failures: AtomicU64::new(0),
            cache_failures: AtomicU64::new(0),
            last_seq: AtomicU64::new(0),
            total_processing_time_ns: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Records a processed batch.
    pub fn record_batch(&self, result: &BatchResult, duration: Duration) {
        self.entries_consumed
            .fetch_add(result.consumed as u64, Ordering::Relaxed);
        self.events_applied
            .fetch_add(result.applied as u64, Ordering::Relaxed);
        self.decode_skipped
            .fetch_add(result.decode_skipped as u64, Ordering::Relaxed);
        self.deploys_rejected
            .fetch_add(result.deploys_rejected as u64, Ordering::Relaxed);
        self.total_processing_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Records a handled retraction.
    pub fn record_retraction(&self) {
        self.entries_consumed.fetch_add(1, Ordering::Relaxed);
        self.retractions.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a successful commit up to `seq`.
    pub fn record_commit(&self, seq: u64) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.last_seq.fetch_max(seq, Ordering::Relaxed);
    }

    /// Records a failed commit.
    pub fn record_commit_failure(&self) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed cache write.
    pub fn record_cache_failure(&self) {
        self.cache_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of log entries consumed.
    #[must_use]
    pub fn entries_consumed(&self) -> u64 {
        self.entries_consumed.load(Ordering::Relaxed)
    }

    /// Returns the number of events applied.
    #[must_use]
    pub fn events_applied(&self) -> u64 {
        self.events_applied.load(Ordering::Relaxed)
    }

    /// Returns the number of events skipped on decode errors.
    #[must_use]
    pub fn decode_skipped(&self) -> u64 {
        self.decode_skipped.load(Ordering::Relaxed)
    }

    /// Returns the number of rejected deploys.
    #[must_use]
    pub fn deploys_rejected(&self) -> u64 {
        self.deploys_rejected.load(Ordering::Relaxed)
    }

    /// Returns the number of retractions handled.
    #[must_use]
    pub fn retractions(&self) -> u64 {
        self.retractions.load(Ordering::Relaxed)
    }

    /// Returns the number of successful commits.
    #[must_use]
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Returns the number of failed commits.
    #[must_use]
    pub fn commit_failures(&self) -> u64 {
        self.commit_failures.load(Ordering::Relaxed)
    }

    /// Returns the number of failed cache writes.
    #[must_use]
    pub fn cache_failures(&self) -> u64 {
        self.cache_failures.load(Ordering::Relaxed)
    }

    /// Returns the last committed sequence.
    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.last_seq.load(Ordering::Relaxed)
    }

    /// Returns the average processing time per consumed entry.
    #[must_use]
    pub fn average_processing_time(&self) -> Duration {
        let count = self.entries_consumed();
        if count == 0 {
            return Duration::ZERO;
        }
        let total_ns = self.total_processing_time_ns.load(Ordering::Relaxed);
        Duration::from_nanos(total_ns / count)
    }

    /// Returns the consumed entries per second since start.
    #[must_use]
    pub fn entries_per_second(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.entries_consumed() as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Returns a snapshot of all metrics.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            entries_consumed: self.entries_consumed(),
            events_applied: self.events_applied(),
            decode_skipped: self.decode_skipped(),
            deploys_rejected: self.deploys_rejected(),
            retractions: self.retractions(),
            commits: self.commits(),
            commit_failures: self.commit_failures(),
            cache_failures: self.cache_failures(),
            last_seq: self.last_seq(),
            entries_per_second: self.entries_per_second(),
        }
    }
}

/// A point-in-time snapshot of indexer metrics.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Log entries consumed.
    pub entries_consumed: u64,
    /// Events applied.
    pub events_applied: u64,
    /// Events skipped on decode errors.
    pub decode_skipped: u64,
    /// Deploys rejected.
    pub deploys_rejected: u64,
    /// Retractions handled.
    pub retractions: u64,
    /// Successful commits.
    pub commits: u64,
    /// Failed commits.
    pub commit_failures: u64,
    /// Failed cache writes.
    pub cache_failures: u64,
    /// Last committed sequence.
    pub last_seq: u64,
    /// Consumption rate.
    pub entries_per_second: f64,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seq {} - {} entries ({:.1}/s), {} applied, {} skipped, {} rejected, {} retractions, {} commits ({} failed), {} cache failures",
            self.last_seq,
            self.entries_consumed,
            self.entries_per_second,
            self.events_applied,
            self.decode_skipped,
            self.deploys_rejected,
            self.retractions,
            self.commits,
            self.commit_failures,
            self.cache_failures
        )
    }
}
