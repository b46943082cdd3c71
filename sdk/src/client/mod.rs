//! Chain data client.
//!
//! This module provides access to the upstream blockchain data service:
//! a [`ChainSource`] trait with HTTP and in-memory implementations, bounded
//! retry with exponential backoff, and a restartable [`Subscription`] that
//! yields the transactions of one topic block by block.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use txoflow_sdk::client::{ChainClientConfig, HttpChainSource, Subscription};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ChainClientConfig::new("https://junglebus.gorillapool.io");
//!     let source = Arc::new(HttpChainSource::new(config.clone())?);
//!     let mut sub = Subscription::new(source, config, "bsv21", 811302);
//!
//!     loop {
//!         let item = sub.next().await?;
//!         println!("{:?}", item);
//!     }
//! }
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod memory;
pub mod retry;
pub mod source;
pub mod subscription;

pub use config::ChainClientConfig;
pub use error::ChainError;
pub use http::HttpChainSource;
pub use memory::MemoryChainSource;
pub use retry::with_retry;
pub use source::ChainSource;
pub use subscription::Subscription;
