//! txoflow Listener - follows the chain and appends topic events to the log.
//!
//! The listener is the only writer of a topic's event log. It subscribes to
//! the upstream chain service, normalizes matching transactions into
//! events, and appends each block atomically together with its hash. Forks
//! are answered with a retraction so the indexer can refold.
//!
//! # Components
//!
//! - [`service`]: Main listener service and its connection states
//! - [`builder`]: Event normalization and lite-mode fetches
//! - [`reorg`]: Fork detection against the retained block window
//! - [`appender`]: Head-guarded log appends
//! - [`metrics`]: Listener metrics
//! - [`config`]: Listener configuration
//! - [`error`]: Error types and exit codes

pub mod appender;
pub mod builder;
pub mod config;
pub mod error;
pub mod metrics;
pub mod reorg;
pub mod service;

pub use appender::Appender;
pub use builder::EventBuilder;
pub use config::{ConfigError, ListenerConfig};
pub use error::ListenerError;
pub use metrics::{ListenerMetrics, MetricsSnapshot};
pub use reorg::{BlockCheck, Fork, ReorgDetector};
pub use service::{ListenerService, ListenerState};
