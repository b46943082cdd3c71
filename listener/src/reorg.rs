//! Fork detection for the listener.
//!
//! Every appended block records its hash in a retained window. A delivered
//! block either extends the recorded chain, repeats a recorded block, or
//! conflicts with it. On conflict the window is walked back against the
//! upstream headers to find the lowest diverging height.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};
use txoflow_sdk::client::with_retry;
use txoflow_sdk::{BlockHeader, ChainClientConfig, ChainSource};

use super::error::ListenerError;

/// Classification of a delivered block against the recorded window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCheck {
    /// The block is new and extends the recorded chain.
    Extends,
    /// The block was already appended.
    Redelivered,
    /// The block conflicts with a recorded hash.
    Conflict,
}

impl fmt::Display for BlockCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Extends => write!(f, "extends"),
            Self::Redelivered => write!(f, "redelivered"),
            Self::Conflict => write!(f, "conflict"),
        }
    }
}

/// A located fork.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fork {
    /// Height of the block whose delivery revealed the fork.
    pub detected_at: u64,
    /// Lowest diverging height.
    pub height: u64,
    /// Upstream hash at `height`, if the upstream has that block.
    pub block_hash: Option<String>,
    /// Number of recorded blocks rolled back.
    pub depth: u64,
}

/// Detects forks between the recorded window and the upstream chain.
pub struct ReorgDetector {
    /// Upstream headers.
    source: Arc<dyn ChainSource>,

    /// Retry settings for header lookups.
    client: ChainClientConfig,

    /// Height the log starts at.
    start_height: u64,
}

impl ReorgDetector {
    /// Creates a new detector.
    #[must_use]
    pub fn new(source: Arc<dyn ChainSource>, client: ChainClientConfig, start_height: u64) -> Self {
        Self {
            source,
            client,
            start_height,
        }
    }

    /// Classifies a delivered block.
    ///
    /// Blocks at or below the provisional height without a recorded hash
    /// have fallen out of the window and are treated as re-delivered.
    #[must_use]
    pub fn check(
        header: &BlockHeader,
        window: &BTreeMap<u64, String>,
        provisional: Option<u64>,
    ) -> BlockCheck {
        match window.get(&header.height) {
            Some(hash) if *hash == header.hash => return BlockCheck::Redelivered,
            Some(_) => return BlockCheck::Conflict,
            None => {}
        }

        if provisional.is_some_and(|p| header.height <= p) {
            return BlockCheck::Redelivered;
        }

        match header
            .height
            .checked_sub(1)
            .and_then(|parent| window.get(&parent))
        {
            Some(parent) if *parent != header.prev_hash => BlockCheck::Conflict,
            _ => BlockCheck::Extends,
        }
    }

    /// Walks the window back from `header` until it agrees with upstream.
    ///
    /// Returns `None` if no recorded hash diverges from upstream.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::ReorgTooDeep`] if every retained hash
    /// diverges and the window does not reach the start height, or a chain
    /// error from the header lookups.
    pub async fn find_fork(
        &self,
        header: &BlockHeader,
        window: &BTreeMap<u64, String>,
    ) -> Result<Option<Fork>, ListenerError> {
        let mut lowest_diverging: Option<u64> = None;

        for (&height, recorded) in window.range(..=header.height).rev() {
            let upstream = with_retry(&self.client, height, || self.source.block_header(height)).await?;
            match upstream {
                Some(upstream) if upstream.hash == *recorded => {
                    debug!(height, "recorded block agrees with upstream");
                    break;
                }
                _ => lowest_diverging = Some(height),
            }
        }

        let Some(height) = lowest_diverging else {
            return Ok(None);
        };

        // Every retained hash diverged; the fork may lie below the window.
        let floor = window.keys().next().copied().unwrap_or(height);
        if height == floor && floor > self.start_height {
            return Err(ListenerError::ReorgTooDeep {
                height: header.height,
                floor,
            });
        }

        let block_hash = if height == header.height {
            Some(header.hash.clone())
        } else {
            with_retry(&self.client, height, || self.source.block_header(height))
                .await?
                .map(|h| h.hash)
        };
        let depth = window.range(height..).count() as u64;

        warn!(
            detected_at = header.height,
            fork = height,
            depth,
            "Reorg detected"
        );
        Ok(Some(Fork {
            detected_at: header.height,
            height,
            block_hash,
            depth,
        }))
    }
}
