//! txoflow SDK - shared types and chain client for the txoflow services.
//!
//! This crate provides the event log model written by the listener and
//! folded by the indexer, the token operation codec, and a client for the
//! upstream chain data service.
//!
//! # Core Types
//!
//! - [`Event`] - A normalized on-chain transaction in the log
//! - [`LogEntry`] / [`LogOp`] - Sequenced log operations (append or retract)
//! - [`Checkpoint`] - Durable indexing progress
//! - [`TokenState`] / [`TokenInfo`] - Materialized token balances and metadata
//! - [`TokenOp`] - Decoded token operation
//!
//! # Chain Client
//!
//! - [`ChainSource`] - Upstream data access
//! - [`Subscription`] - Restartable block-by-block topic stream
//!
//! # Example
//!
//! ```rust
//! use txoflow_sdk::TokenOp;
//!
//! let op = TokenOp::decode(r#"{"p":"bsv-20","op":"transfer","from":"A","to":"B","amt":"30"}"#);
//! assert_eq!(op.map(|op| op.amount()).ok(), Some(30));
//! ```

pub mod client;
pub mod error;
pub mod types;

pub use client::{ChainClientConfig, ChainError, ChainSource, HttpChainSource, Subscription};
pub use error::SdkError;
pub use types::{
    surviving_events, BlockHeader, Checkpoint, Event, LogEntry, LogOp, RawBlock, RawBlockEvent,
    RawTransaction, TokenInfo, TokenOp, TokenState, Transaction,
};
