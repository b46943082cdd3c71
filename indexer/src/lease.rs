//! Leased single-writer lock.
//!
//! A lease is a key in the durable store holding the owner id with an
//! expiry. It is taken with `SET NX PX`, extended only while still owned,
//! and deleted only by its owner. State commits made while the lease is
//! held carry a [`LeaseGuard`] so the store refuses them once it is gone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::store::{keys, DurableStore, LeaseGuard, StoreError};

/// Lease errors.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// Another process holds the lease.
    #[error("lease {key} is held by another process")]
    Held {
        /// Lease key.
        key: String,
    },

    /// The lease expired or was taken over.
    #[error("lease {key} was lost")]
    Lost {
        /// Lease key.
        key: String,
    },

    /// Store failure while handling the lease.
    #[error("lease store error: {0}")]
    Store(#[from] StoreError),
}

impl LeaseError {
    /// Returns true if retrying may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_transient())
    }
}

/// A named lease on a topic.
pub struct Lease {
    store: Arc<dyn DurableStore>,
    key: String,
    owner: String,
    ttl: Duration,
    held: AtomicBool,
}

impl Lease {
    /// Creates a lease handle for `role` on `topic`. Nothing is acquired yet.
    #[must_use]
    pub fn new(
        store: Arc<dyn DurableStore>,
        role: &str,
        topic: &str,
        owner: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            key: keys::lock(role, topic),
            owner: owner.into(),
            ttl,
            held: AtomicBool::new(false),
        }
    }

    /// Returns the lease key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the owner id.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Returns true between a successful acquire and the release or loss.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Returns the guard for commits made under this lease, if held.
    #[must_use]
    pub fn guard(&self) -> Option<LeaseGuard> {
        self.is_held().then(|| LeaseGuard {
            key: self.key.clone(),
            owner: self.owner.clone(),
        })
    }

    /// Takes the lease.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Held`] if another owner holds it.
    pub async fn acquire(&self) -> Result<(), LeaseError> {
        if self
            .store
            .acquire_lease(&self.key, &self.owner, self.ttl)
            .await?
        {
            self.held.store(true, Ordering::Release);
            info!(key = %self.key, owner = %self.owner, "lease acquired");
            Ok(())
        } else {
            Err(LeaseError::Held {
                key: self.key.clone(),
            })
        }
    }

    /// Extends the lease.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Lost`] if the lease is no longer ours.
    pub async fn renew(&self) -> Result<(), LeaseError> {
        if self
            .store
            .renew_lease(&self.key, &self.owner, self.ttl)
            .await?
        {
            debug!(key = %self.key, "lease renewed");
            Ok(())
        } else {
            self.held.store(false, Ordering::Release);
            Err(LeaseError::Lost {
                key: self.key.clone(),
            })
        }
    }

    /// Releases the lease if still held. Failures are logged.
    pub async fn release(&self) {
        if !self.held.swap(false, Ordering::AcqRel) {
            return;
        }
        match self.store.release_lease(&self.key, &self.owner).await {
            Ok(true) => info!(key = %self.key, "lease released"),
            Ok(false) => warn!(key = %self.key, "lease was no longer held at release"),
            Err(e) => warn!(key = %self.key, "failed to release lease: {}", e),
        }
    }
}
