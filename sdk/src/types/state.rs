//! Materialized token state types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Balance of one holder for one token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
    /// Token (topic) id.
    pub token: String,

    /// Holder address.
    pub holder: String,

    /// Current balance in base units.
    pub balance: u64,

    /// Sequence of the last event that touched this holder.
    pub last_seq: u64,

    /// Height of the last event that touched this holder.
    pub last_height: u64,
}

impl TokenState {
    /// Creates an empty state for a holder.
    #[must_use]
    pub fn empty(token: impl Into<String>, holder: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            holder: holder.into(),
            balance: 0,
            last_seq: 0,
            last_height: 0,
        }
    }

    /// Returns true if the balance is zero.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.balance == 0
    }
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}={}", self.token, self.holder, self.balance)
    }
}

/// Token metadata established by the deploy operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    /// Token (topic) id.
    pub token: String,

    /// Ticker symbol, if any.
    pub symbol: Option<String>,

    /// Display decimals.
    pub decimals: u8,

    /// Circulating supply (minted minus burned).
    pub supply: u64,

    /// Holder that received the initial mint.
    pub deployer: String,

    /// Height of the deploy.
    pub deployed_height: u64,

    /// Sequence of the deploy.
    pub deployed_seq: u64,
}
