//! Core types for txoflow.
//!
//! This module provides the log, checkpoint, state and upstream chain types
//! shared by the listener and the indexer.

pub mod block;
pub mod checkpoint;
pub mod event;
pub mod op;
pub mod state;

pub use block::{BlockHeader, RawBlock, RawBlockEvent, RawTransaction, Transaction};
pub use checkpoint::Checkpoint;
pub use event::{surviving_events, Event, LogEntry, LogOp};
pub use op::TokenOp;
pub use state::{TokenInfo, TokenState};
