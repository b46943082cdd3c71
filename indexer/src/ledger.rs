//! Token ledger and the deterministic fold.
//!
//! A [`Ledger`] holds the balances of the holders it has seen plus the token
//! metadata. [`Ledger::apply`] folds one event into it; it is a pure function
//! of the prior ledger and the event, so replaying the surviving events of
//! the log in sequence order always reproduces the same state.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;
use txoflow_sdk::{surviving_events, Event, LogEntry, TokenInfo, TokenOp, TokenState};

use crate::events::types::{FoldOutcome, SkipReason};

/// A data-consistency violation. Always fatal for the topic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsistencyError {
    /// A debit exceeds the holder's balance.
    #[error("seq {seq}: {holder} holds {balance}, cannot debit {amount}")]
    InsufficientBalance {
        /// Offending log sequence.
        seq: u64,
        /// Debited holder.
        holder: String,
        /// Balance before the debit.
        balance: u64,
        /// Requested debit.
        amount: u64,
    },

    /// A credit or the supply would overflow.
    #[error("seq {seq}: amount overflow for {holder}")]
    Overflow {
        /// Offending log sequence.
        seq: u64,
        /// Credited holder (or the token id for the supply).
        holder: String,
    },

    /// The checkpoint claims more entries than the log holds.
    #[error("checkpoint seq {checkpoint} is ahead of log head {head}")]
    CheckpointAhead {
        /// Checkpoint sequence.
        checkpoint: u64,
        /// Log head.
        head: u64,
    },

    /// The log skipped a sequence number.
    #[error("log gap: expected seq {expected}, found {found}")]
    Gap {
        /// Expected sequence.
        expected: u64,
        /// Sequence found.
        found: u64,
    },
}

/// Balances and metadata of one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ledger {
    token: String,
    states: BTreeMap<String, TokenState>,
    info: Option<TokenInfo>,
    touched: BTreeSet<String>,
    info_changed: bool,
}

impl Ledger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            states: BTreeMap::new(),
            info: None,
            touched: BTreeSet::new(),
            info_changed: false,
        }
    }

    /// Returns the token id.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Returns the token metadata, if deployed.
    #[must_use]
    pub const fn info(&self) -> Option<&TokenInfo> {
        self.info.as_ref()
    }

    /// Seeds the token metadata without marking it changed.
    pub fn set_info(&mut self, info: Option<TokenInfo>) {
        self.info = info;
    }

    /// Seeds a holder state without marking it changed.
    pub fn insert(&mut self, state: TokenState) {
        self.states.insert(state.holder.clone(), state);
    }

    /// Returns true if the holder is loaded.
    #[must_use]
    pub fn contains(&self, holder: &str) -> bool {
        self.states.contains_key(holder)
    }

    /// Returns the state of a holder, if loaded.
    #[must_use]
    pub fn state(&self, holder: &str) -> Option<&TokenState> {
        self.states.get(holder)
    }

    /// Returns the balance of a holder (0 if unknown).
    #[must_use]
    pub fn balance(&self, holder: &str) -> u64 {
        self.states.get(holder).map_or(0, |s| s.balance)
    }

    /// Returns all holder states ordered by holder.
    pub fn states(&self) -> impl Iterator<Item = &TokenState> {
        self.states.values()
    }

    /// Returns the sum of all balances.
    #[must_use]
    pub fn total(&self) -> u128 {
        self.states.values().map(|s| u128::from(s.balance)).sum()
    }

    /// Returns true if the fold touched anything since the last [`take_changes`](Self::take_changes).
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.touched.is_empty() || self.info_changed
    }

    /// Returns the states and metadata changed since the last call and resets tracking.
    pub fn take_changes(&mut self) -> (Vec<TokenState>, Option<TokenInfo>) {
        let touched = std::mem::take(&mut self.touched);
        let states = touched
            .iter()
            .filter_map(|holder| self.states.get(holder).cloned())
            .collect();
        let info = if std::mem::take(&mut self.info_changed) {
            self.info.clone()
        } else {
            None
        };
        (states, info)
    }

    /// Folds one event into the ledger.
    ///
    /// Undecodable payloads and repeated deploys are skipped. Nothing is
    /// modified when an error is returned.
    ///
    /// # Errors
    ///
    /// Returns a [`ConsistencyError`] if a debit exceeds a balance or an
    /// amount overflows.
    pub fn apply(&mut self, event: &Event) -> Result<FoldOutcome, ConsistencyError> {
        let op = match TokenOp::decode(&event.payload) {
            Ok(op) => op,
            Err(e) => {
                debug!(seq = event.seq, txid = %event.txid, "undecodable payload: {}", e);
                return Ok(FoldOutcome::Skipped(SkipReason::Decode(e.to_string())));
            }
        };

        match op {
            TokenOp::DeployMint { to, amt, sym, dec } => {
                if self.info.is_some() {
                    return Ok(FoldOutcome::Skipped(SkipReason::DuplicateDeploy));
                }
                let credited = self.credited(event, &to, amt)?;
                self.put(credited);
                self.info = Some(TokenInfo {
                    token: self.token.clone(),
                    symbol: sym,
                    decimals: dec,
                    supply: amt,
                    deployer: to,
                    deployed_height: event.height,
                    deployed_seq: event.seq,
                });
                self.info_changed = true;
            }
            TokenOp::Transfer { from, to, amt } => {
                let debited = self.debited(event, &from, amt)?;
                if from == to {
                    // Self transfer: only the touch is recorded.
                    let mut same = debited;
                    same.balance = self.balance(&from);
                    self.put(same);
                } else {
                    let credited = self.credited(event, &to, amt)?;
                    self.put(debited);
                    self.put(credited);
                }
            }
            TokenOp::Burn { from, amt } => {
                let debited = self.debited(event, &from, amt)?;
                let supply = self
                    .info
                    .as_ref()
                    .map_or(Some(0), |i| i.supply.checked_sub(amt))
                    .ok_or_else(|| ConsistencyError::Overflow {
                        seq: event.seq,
                        holder: self.token.clone(),
                    })?;
                self.put(debited);
                if let Some(info) = self.info.as_mut() {
                    info.supply = supply;
                    self.info_changed = true;
                }
            }
        }

        Ok(FoldOutcome::Applied)
    }

    fn debited(&self, event: &Event, holder: &str, amt: u64) -> Result<TokenState, ConsistencyError> {
        let mut state = self.current(holder);
        state.balance = state
            .balance
            .checked_sub(amt)
            .ok_or_else(|| ConsistencyError::InsufficientBalance {
                seq: event.seq,
                holder: holder.to_string(),
                balance: state.balance,
                amount: amt,
            })?;
        state.last_seq = event.seq;
        state.last_height = event.height;
        Ok(state)
    }

    fn credited(&self, event: &Event, holder: &str, amt: u64) -> Result<TokenState, ConsistencyError> {
        let mut state = self.current(holder);
        state.balance =
            state
                .balance
                .checked_add(amt)
                .ok_or_else(|| ConsistencyError::Overflow {
                    seq: event.seq,
                    holder: holder.to_string(),
                })?;
        state.last_seq = event.seq;
        state.last_height = event.height;
        Ok(state)
    }

    fn current(&self, holder: &str) -> TokenState {
        self.states
            .get(holder)
            .cloned()
            .unwrap_or_else(|| TokenState::empty(self.token.clone(), holder))
    }

    fn put(&mut self, state: TokenState) {
        self.touched.insert(state.holder.clone());
        self.states.insert(state.holder.clone(), state);
    }
}

/// Counters from a replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Log entries read.
    pub entries: u64,
    /// Events that survived retractions.
    pub surviving: u64,
    /// Events applied.
    pub applied: u64,
    /// Events skipped.
    pub skipped: u64,
}

/// Rebuilds a ledger from a log prefix.
///
/// Only the events surviving the retractions in `entries` are folded.
///
/// # Errors
///
/// Returns the first consistency violation met during the fold.
pub fn replay(token: &str, entries: &[LogEntry]) -> Result<(Ledger, ReplayStats), ConsistencyError> {
    let mut ledger = Ledger::new(token);
    let mut stats = ReplayStats {
        entries: entries.len() as u64,
        ..Default::default()
    };

    for event in surviving_events(entries) {
        stats.surviving += 1;
        match ledger.apply(&event)? {
            FoldOutcome::Applied => stats.applied += 1,
            FoldOutcome::Skipped(_) => stats.skipped += 1,
        }
    }

    let _ = ledger.take_changes();
    Ok((ledger, stats))
}
