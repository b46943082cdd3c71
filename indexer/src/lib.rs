//! txoflow Indexer - folds a topic's event log into token state.
//!
//! This crate owns the durable storage layout shared with the listener
//! and the indexer service that consumes the log in sequence order.
//!
//! # Components
//!
//! - [`store`]: Durable store (event log, block window, state, leases)
//! - [`cache`]: Read-optimized state mirror
//! - [`ledger`]: Deterministic token state fold
//! - [`events`]: Batch processing and metrics
//! - [`lease`]: Single-writer leases
//! - [`service`]: Main indexer service
//! - [`config`]: Indexer configuration
//! - [`error`]: Error types and exit codes

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod lease;
pub mod service;
pub mod store;

pub use cache::{CacheConfig, CacheError, CacheStore, MemoryCache, RedisCache};
pub use config::{ConfigError, IndexerConfig};
pub use error::IndexerError;
pub use events::{BatchResult, EventProcessor, IndexerMetrics};
pub use ledger::{ConsistencyError, Ledger};
pub use lease::{Lease, LeaseError};
pub use service::{IndexerService, PollOutcome};
pub use store::{
    AppendBatch, Commit, DurableStore, LeaseGuard, MemoryStore, RedisStore, StoreError,
};
