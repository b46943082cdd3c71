//! In-memory chain data source.
//!
//! A scripted chain for tests and local runs: blocks are pushed explicitly,
//! the tail can be replaced to simulate a reorganization, and transient
//! failures can be injected.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::error::ChainError;
use super::source::ChainSource;
use crate::types::{BlockHeader, RawBlock, RawTransaction, Transaction};

#[derive(Debug, Default)]
struct Chain {
    blocks: BTreeMap<u64, RawBlock>,
    transactions: HashMap<String, Transaction>,
}

/// In-memory chain data source.
#[derive(Debug)]
pub struct MemoryChainSource {
    start_height: u64,
    chain: Mutex<Chain>,
    fail_next: AtomicU32,
    calls: AtomicU64,
}

impl MemoryChainSource {
    /// Creates an empty chain whose first block will be at `start_height`.
    #[must_use]
    pub fn new(start_height: u64) -> Self {
        Self {
            start_height,
            chain: Mutex::new(Chain::default()),
            fail_next: AtomicU32::new(0),
            calls: AtomicU64::new(0),
        }
    }

    fn chain(&self) -> MutexGuard<'_, Chain> {
        // A poisoned lock only means a test panicked mid-update; the data is still usable.
        self.chain.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends a block on top of the current tip.
    ///
    /// Each payload becomes one matching transaction with id `{hash}-{index}`.
    /// A `None` payload produces a lite transaction whose body is only
    /// available through [`ChainSource::fetch_tx`].
    pub fn push_block(&self, hash: &str, payloads: &[Option<&str>]) -> BlockHeader {
        let mut chain = self.chain();
        let (height, prev_hash) = match chain.blocks.values().next_back() {
            Some(tip) => (tip.header.height + 1, tip.header.hash.clone()),
            None => (self.start_height, format!("parent-of-{}", hash)),
        };
        let header = BlockHeader {
            height,
            hash: hash.to_string(),
            prev_hash,
            time: height,
        };

        let mut transactions = Vec::with_capacity(payloads.len());
        for (idx, payload) in payloads.iter().enumerate() {
            let id = format!("{}-{}", hash, idx);
            chain.transactions.insert(
                id.clone(),
                Transaction {
                    id: id.clone(),
                    block_height: Some(height),
                    payload: payload.map(str::to_string),
                },
            );
            transactions.push(RawTransaction {
                id,
                block_height: height,
                block_index: idx as u64,
                block_hash: hash.to_string(),
                payload: payload.map(str::to_string),
            });
        }

        chain.blocks.insert(
            height,
            RawBlock {
                header: header.clone(),
                transactions,
            },
        );
        header
    }

    /// Drops every block at or above `height`, so new pushes fork from `height - 1`.
    pub fn truncate(&self, height: u64) {
        let mut chain = self.chain();
        let _ = chain.blocks.split_off(&height);
    }

    /// Registers a transaction that is only reachable by id.
    pub fn insert_transaction(&self, tx: Transaction) {
        self.chain().transactions.insert(tx.id.clone(), tx);
    }

    /// Makes the next `count` calls fail with a timeout.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Returns the number of calls served (including failed ones).
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Returns the current tip height, if any block exists.
    #[must_use]
    pub fn tip_height(&self) -> Option<u64> {
        self.chain().blocks.keys().next_back().copied()
    }

    fn enter(&self) -> Result<(), ChainError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ChainError::Timeout);
        }
        Ok(())
    }
}

#[async_trait]
impl ChainSource for MemoryChainSource {
    async fn chain_tip(&self) -> Result<BlockHeader, ChainError> {
        self.enter()?;
        let chain = self.chain();
        match chain.blocks.values().next_back() {
            Some(block) => Ok(block.header.clone()),
            None => Ok(BlockHeader {
                height: self.start_height.saturating_sub(1),
                hash: String::new(),
                prev_hash: String::new(),
                time: 0,
            }),
        }
    }

    async fn block_header(&self, height: u64) -> Result<Option<BlockHeader>, ChainError> {
        self.enter()?;
        Ok(self.chain().blocks.get(&height).map(|b| b.header.clone()))
    }

    async fn block(&self, _topic: &str, height: u64) -> Result<Option<RawBlock>, ChainError> {
        self.enter()?;
        Ok(self.chain().blocks.get(&height).cloned())
    }

    async fn fetch_tx(&self, txid: &str) -> Result<Transaction, ChainError> {
        self.enter()?;
        self.chain()
            .transactions
            .get(txid)
            .cloned()
            .ok_or_else(|| ChainError::NotFound(format!("transaction {}", txid)))
    }
}
