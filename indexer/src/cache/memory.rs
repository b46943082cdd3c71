//! In-memory cache store.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use txoflow_sdk::TokenState;

use super::{CacheError, CacheStore, DEFAULT_RECENT_LIMIT};
use crate::store::keys;

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, TokenState>,
    recent: HashMap<String, VecDeque<String>>,
}

/// In-memory cache that can be switched off to simulate an outage.
#[derive(Debug)]
pub struct MemoryCache {
    inner: Mutex<Inner>,
    reachable: AtomicBool,
    recent_limit: usize,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    /// Creates an empty, reachable cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            reachable: AtomicBool::new(true),
            recent_limit: DEFAULT_RECENT_LIMIT,
        }
    }

    /// Simulates the cache going down or coming back.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Returns the number of cached holder entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner().entries.len()
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Unavailable)
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn put_states(&self, topic: &str, states: &[TokenState]) -> Result<(), CacheError> {
        self.check()?;
        let mut inner = self.inner();
        for state in states {
            let key = keys::cache_state(topic, &state.holder);
            if state.is_empty() {
                inner.entries.remove(&key);
            } else {
                inner.entries.insert(key, state.clone());
            }

            let recent = inner.recent.entry(topic.to_string()).or_default();
            recent.push_front(state.holder.clone());
            recent.truncate(self.recent_limit);
        }
        Ok(())
    }

    async fn get_state(
        &self,
        topic: &str,
        holder: &str,
    ) -> Result<Option<TokenState>, CacheError> {
        self.check()?;
        Ok(self
            .inner()
            .entries
            .get(&keys::cache_state(topic, holder))
            .cloned())
    }

    async fn recent_holders(&self, topic: &str) -> Result<Vec<String>, CacheError> {
        self.check()?;
        Ok(self
            .inner()
            .recent
            .get(topic)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear(&self, topic: &str) -> Result<u64, CacheError> {
        self.check()?;
        let mut inner = self.inner();
        let prefix = format!("cache:{}:", topic);
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !key.starts_with(&prefix));
        let removed = before - inner.entries.len();
        let recent = u64::from(inner.recent.remove(topic).is_some());
        Ok(removed as u64 + recent)
    }
}
