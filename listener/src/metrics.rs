//! Listener service metrics.
//!
//! Provides atomic counters for monitoring chain following and appends.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Metrics for the listener service.
#[derive(Debug)]
pub struct ListenerMetrics {
    /// Blocks appended to the log.
    blocks_appended: AtomicU64,

    /// Re-delivered blocks skipped.
    blocks_skipped: AtomicU64,

    /// Events appended.
    events_appended: AtomicU64,

    /// Lite transactions that could not be fetched.
    txs_missing: AtomicU64,

    /// Retractions appended.
    retractions: AtomicU64,

    /// Failed append attempts.
    append_failures: AtomicU64,

    /// Subscription restarts after errors.
    reconnects: AtomicU64,

    /// Height of the last appended block.
    last_height: AtomicU64,

    /// Events appended since the last progress report.
    window_events: AtomicU64,

    /// Start time for rate calculation.
    start_time: Instant,
}

impl Default for ListenerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerMetrics {
    /// Creates a new metrics instance.
    #[must_use]
    pub fn new() -> Self {
        Self {
            blocks_appended: AtomicU64::new(0),
            blocks_skipped: AtomicU64::new(0),
            events_appended: AtomicU64::new(0),
            txs_missing: AtomicU64::new(0),
            retractions: AtomicU64::new(0),
            append_failures: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            last_height: AtomicU64::new(0),
            window_events: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Records an appended block.
    pub fn record_block(&self, height: u64, events: usize) {
        self.blocks_appended.fetch_add(1, Ordering::Relaxed);
        self.events_appended
            .fetch_add(events as u64, Ordering::Relaxed);
        self.window_events
            .fetch_add(events as u64, Ordering::Relaxed);
        self.last_height.store(height, Ordering::Relaxed);
    }

    /// Records a skipped re-delivered block.
    pub fn record_skipped_block(&self) {
        self.blocks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a lite transaction that could not be fetched.
    pub fn record_missing_tx(&self) {
        self.txs_missing.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an appended retraction at `height`.
    pub fn record_retraction(&self, height: u64) {
        self.retractions.fetch_add(1, Ordering::Relaxed);
        self.last_height
            .store(height.saturating_sub(1), Ordering::Relaxed);
    }

    /// Records a failed append attempt.
    pub fn record_append_failure(&self) {
        self.append_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a subscription restart.
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of appended blocks.
    #[must_use]
    pub fn blocks_appended(&self) -> u64 {
        self.blocks_appended.load(Ordering::Relaxed)
    }

    /// Returns the number of skipped blocks.
    #[must_use]
    pub fn blocks_skipped(&self) -> u64 {
        self.blocks_skipped.load(Ordering::Relaxed)
    }

    /// Returns the number of appended events.
    #[must_use]
    pub fn events_appended(&self) -> u64 {
        self.events_appended.load(Ordering::Relaxed)
    }

    /// Returns the number of missing lite transactions.
    #[must_use]
    pub fn txs_missing(&self) -> u64 {
        self.txs_missing.load(Ordering::Relaxed)
    }

    /// Returns the number of retractions.
    #[must_use]
    pub fn retractions(&self) -> u64 {
        self.retractions.load(Ordering::Relaxed)
    }

    /// Returns the number of failed append attempts.
    #[must_use]
    pub fn append_failures(&self) -> u64 {
        self.append_failures.load(Ordering::Relaxed)
    }

    /// Returns the number of reconnects.
    #[must_use]
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Returns the height of the last appended block.
    #[must_use]
    pub fn last_height(&self) -> u64 {
        self.last_height.load(Ordering::Relaxed)
    }

    /// Returns and resets the events appended since the last call.
    pub fn take_window_events(&self) -> u64 {
        self.window_events.swap(0, Ordering::Relaxed)
    }

    /// Returns the appended events per second since start.
    #[must_use]
    pub fn events_per_second(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.events_appended() as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Returns a snapshot of all metrics.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            blocks_appended: self.blocks_appended(),
            blocks_skipped: self.blocks_skipped(),
            events_appended: self.events_appended(),
            txs_missing: self.txs_missing(),
            retractions: self.retractions(),
            append_failures: self.append_failures(),
            reconnects: self.reconnects(),
            last_height: self.last_height(),
            events_per_second: self.events_per_second(),
        }
    }
}

/// A point-in-time snapshot of listener metrics.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Blocks appended.
    pub blocks_appended: u64,
    /// Blocks skipped.
    pub blocks_skipped: u64,
    /// Events appended.
    pub events_appended: u64,
    /// Missing lite transactions.
    pub txs_missing: u64,
    /// Retractions appended.
    pub retractions: u64,
    /// Failed append attempts.
    pub append_failures: u64,
    /// Reconnects.
    pub reconnects: u64,
    /// Last appended height.
    pub last_height: u64,
    /// Append rate.
    pub events_per_second: f64,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Blk {} - {} blocks, {} events ({:.1}/s), {} skipped blocks, {} missing txs, {} retractions, {} reconnects",
            self.last_height,
            self.blocks_appended,
            self.events_appended,
            self.events_per_second,
            self.blocks_skipped,
            self.txs_missing,
            self.retractions,
            self.reconnects
        )
    }
}
