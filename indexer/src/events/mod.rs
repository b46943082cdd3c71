//! Event processor module for the txoflow indexer.
//!
//! This module provides the components that fold log entries into token
//! state.
//!
//! # Components
//!
//! - [`types`]: FoldOutcome, SkipReason, BatchResult types
//! - [`processor`]: EventProcessor implementation
//! - [`metrics`]: Indexer metrics

pub mod metrics;
pub mod processor;
pub mod types;

pub use metrics::{IndexerMetrics, MetricsSnapshot};
pub use processor::EventProcessor;
pub use types::{BatchResult, FoldOutcome, Retraction, SkipReason};
