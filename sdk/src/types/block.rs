//! Upstream chain data types.
//!
//! These mirror what the chain data service returns before the listener
//! normalizes transactions into log events.

use serde::{Deserialize, Serialize};

/// A block header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    /// Block height.
    pub height: u64,

    /// Block hash (hex).
    pub hash: String,

    /// Hash of the parent block (hex).
    pub prev_hash: String,

    /// Block timestamp in seconds since epoch.
    #[serde(default)]
    pub time: u64,
}

impl BlockHeader {
    /// Returns true if `self` directly extends `parent`.
    #[must_use]
    pub fn extends(&self, parent: &Self) -> bool {
        self.height == parent.height.saturating_add(1) && self.prev_hash == parent.hash
    }
}

/// A transaction matched by a topic subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTransaction {
    /// Transaction id (hex).
    pub id: String,

    /// Containing block height.
    pub block_height: u64,

    /// Position inside the block.
    pub block_index: u64,

    /// Containing block hash.
    pub block_hash: String,

    /// Protocol payload; absent when the subscription runs in lite mode.
    #[serde(default)]
    pub payload: Option<String>,
}

/// A block and the transactions in it that matched a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBlock {
    /// The block header.
    pub header: BlockHeader,

    /// Matching transactions in intra-block order.
    #[serde(default)]
    pub transactions: Vec<RawTransaction>,
}

/// A full transaction fetched by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Transaction id (hex).
    pub id: String,

    /// Containing block height, if mined.
    #[serde(default)]
    pub block_height: Option<u64>,

    /// Protocol payload, if the transaction carries one.
    #[serde(default)]
    pub payload: Option<String>,
}

/// One item of a subscription stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawBlockEvent {
    /// A matching transaction.
    Transaction(RawTransaction),

    /// Marks the end of a block; sent even if no transaction matched.
    BlockDone(BlockHeader),
}

impl RawBlockEvent {
    /// Returns the block height of the item.
    #[must_use]
    pub const fn height(&self) -> u64 {
        match self {
            Self::Transaction(tx) => tx.block_height,
            Self::BlockDone(header) => header.height,
        }
    }

    /// Returns true if this item closes a block.
    #[must_use]
    pub const fn is_block_done(&self) -> bool {
        matches!(self, Self::BlockDone(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(height: u64, hash: &str, prev: &str) -> BlockHeader {
        BlockHeader {
            height,
            hash: hash.to_string(),
            prev_hash: prev.to_string(),
            time: 0,
        }
    }

    #[test]
    fn test_header_extends() {
        let parent = header(100, "a", "z");
        assert!(header(101, "b", "a").extends(&parent));
        assert!(!header(101, "b", "x").extends(&parent));
        assert!(!header(102, "b", "a").extends(&parent));
    }

    #[test]
    fn test_raw_block_json() {
        let json = r#"{
            "header": {"height": 811302, "hash": "h1", "prevHash": "h0"},
            "transactions": [
                {"id": "t1", "blockHeight": 811302, "blockIndex": 3, "blockHash": "h1"}
            ]
        }"#;
        let block: RawBlock = serde_json::from_str(json).expect("deserialize");
        assert_eq!(block.header.height, 811_302);
        assert_eq!(block.transactions.len(), 1);
        assert!(block.transactions[0].payload.is_none());
    }

    #[test]
    fn test_raw_block_event_height() {
        let done = RawBlockEvent::BlockDone(header(5, "a", "b"));
        assert_eq!(done.height(), 5);
        assert!(done.is_block_done());
    }
}
