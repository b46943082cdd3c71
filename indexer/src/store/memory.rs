//! In-memory durable store.
//!
//! Mirrors the Redis store semantics, including atomic append with head
//! check and all-or-nothing commits, and supports injecting commit and
//! append failures to simulate crashes.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use txoflow_sdk::{Checkpoint, LogEntry, TokenInfo, TokenState};

use super::{AppendBatch, Commit, DurableStore, LeaseGuard, StoreError};

#[derive(Debug, Default)]
struct Topic {
    log: Vec<LogEntry>,
    blocks: BTreeMap<u64, String>,
    provisional_height: Option<u64>,
    checkpoint: Option<Checkpoint>,
    states: BTreeMap<String, TokenState>,
    token_info: Option<TokenInfo>,
}

#[derive(Debug, Default)]
struct Inner {
    topics: HashMap<String, Topic>,
    leases: HashMap<String, (String, Instant)>,
}

/// In-memory durable store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_commits: AtomicU32,
    fail_appends: AtomicU32,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes the next `count` commits or state replacements fail without writing.
    pub fn fail_next_commits(&self, count: u32) {
        self.fail_commits.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` appends fail without writing.
    pub fn fail_next_appends(&self, count: u32) {
        self.fail_appends.store(count, Ordering::SeqCst);
    }

    /// Overwrites the checkpoint directly, bypassing commit rules.
    pub fn put_checkpoint(&self, checkpoint: Checkpoint) {
        let mut inner = self.inner();
        let topic = inner.topics.entry(checkpoint.topic.clone()).or_default();
        topic.checkpoint = Some(checkpoint);
    }

    /// Returns a copy of the whole log of a topic.
    #[must_use]
    pub fn log(&self, topic: &str) -> Vec<LogEntry> {
        self.inner()
            .topics
            .get(topic)
            .map(|t| t.log.clone())
            .unwrap_or_default()
    }

    fn injected(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_lease(inner: &Inner, guard: Option<&LeaseGuard>) -> Result<(), StoreError> {
        let Some(guard) = guard else { return Ok(()) };
        match inner.leases.get(&guard.key) {
            Some((owner, expires)) if *owner == guard.owner && *expires > Instant::now() => Ok(()),
            _ => Err(StoreError::LeaseLost {
                key: guard.key.clone(),
            }),
        }
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn head_seq(&self, topic: &str) -> Result<u64, StoreError> {
        Ok(self
            .inner()
            .topics
            .get(topic)
            .and_then(|t| t.log.last())
            .map_or(0, |e| e.seq))
    }

    async fn append(&self, topic: &str, batch: &AppendBatch) -> Result<u64, StoreError> {
        batch.validate()?;
        if Self::injected(&self.fail_appends) {
            return Err(StoreError::Unavailable("injected append failure".to_string()));
        }

        let mut inner = self.inner();
        let t = inner.topics.entry(topic.to_string()).or_default();
        let head = t.log.last().map_or(0, |e| e.seq);
        if head != batch.expected_head {
            return Err(StoreError::HeadMismatch {
                expected: batch.expected_head,
                actual: head,
            });
        }

        t.log.extend(batch.entries.iter().cloned());
        if let Some(from) = batch.drop_blocks_from {
            let _ = t.blocks.split_off(&from);
        }
        if let Some(below) = batch.prune_blocks_below {
            t.blocks = t.blocks.split_off(&below);
        }
        if let Some((height, hash)) = &batch.block {
            t.blocks.insert(*height, hash.clone());
        }
        if let Some(height) = batch.provisional_height {
            t.provisional_height = Some(height);
        }
        Ok(batch.next_head())
    }

    async fn read_log(
        &self,
        topic: &str,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, StoreError> {
        Ok(self
            .inner()
            .topics
            .get(topic)
            .map(|t| {
                t.log
                    .iter()
                    .filter(|e| e.seq > after_seq)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn block_hashes(&self, topic: &str) -> Result<BTreeMap<u64, String>, StoreError> {
        Ok(self
            .inner()
            .topics
            .get(topic)
            .map(|t| t.blocks.clone())
            .unwrap_or_default())
    }

    async fn provisional_height(&self, topic: &str) -> Result<Option<u64>, StoreError> {
        Ok(self
            .inner()
            .topics
            .get(topic)
            .and_then(|t| t.provisional_height))
    }

    async fn load_checkpoint(&self, topic: &str) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self
            .inner()
            .topics
            .get(topic)
            .and_then(|t| t.checkpoint.clone()))
    }

    async fn load_state(
        &self,
        topic: &str,
        holder: &str,
    ) -> Result<Option<TokenState>, StoreError> {
        Ok(self
            .inner()
            .topics
            .get(topic)
            .and_then(|t| t.states.get(holder).cloned()))
    }

    async fn load_states(&self, topic: &str) -> Result<Vec<TokenState>, StoreError> {
        Ok(self
            .inner()
            .topics
            .get(topic)
            .map(|t| t.states.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn load_token_info(&self, topic: &str) -> Result<Option<TokenInfo>, StoreError> {
        Ok(self
            .inner()
            .topics
            .get(topic)
            .and_then(|t| t.token_info.clone()))
    }

    async fn commit(&self, commit: &Commit) -> Result<(), StoreError> {
        if Self::injected(&self.fail_commits) {
            return Err(StoreError::Unavailable("injected commit failure".to_string()));
        }

        let mut inner = self.inner();
        Self::check_lease(&inner, commit.lease.as_ref())?;
        let t = inner.topics.entry(commit.topic().to_string()).or_default();
        for state in &commit.states {
            t.states.insert(state.holder.clone(), state.clone());
        }
        for holder in &commit.removed {
            t.states.remove(holder);
        }
        if let Some(info) = &commit.token_info {
            t.token_info = Some(info.clone());
        }
        t.checkpoint = Some(commit.checkpoint.clone());
        Ok(())
    }

    async fn replace_state(&self, commit: &Commit) -> Result<(), StoreError> {
        if Self::injected(&self.fail_commits) {
            return Err(StoreError::Unavailable("injected commit failure".to_string()));
        }

        let mut inner = self.inner();
        Self::check_lease(&inner, commit.lease.as_ref())?;
        let t = inner.topics.entry(commit.topic().to_string()).or_default();
        t.states = commit
            .states
            .iter()
            .map(|s| (s.holder.clone(), s.clone()))
            .collect();
        t.token_info = commit.token_info.clone();
        t.checkpoint = Some(commit.checkpoint.clone());
        Ok(())
    }

    async fn acquire_lease(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner();
        if let Some((_, expires)) = inner.leases.get(key) {
            if *expires > now {
                return Ok(false);
            }
        }
        inner
            .leases
            .insert(key.to_string(), (owner.to_string(), now + ttl));
        Ok(true)
    }

    async fn renew_lease(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner();
        match inner.leases.get_mut(key) {
            Some((holder, expires)) if holder.as_str() == owner && *expires > now => {
                *expires = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner();
        let held = matches!(inner.leases.get(key), Some((holder, _)) if holder == owner);
        if held {
            inner.leases.remove(key);
        }
        Ok(held)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn retract(seq: u64, height: u64) -> LogEntry {
        LogEntry::retract(seq, height, None)
    }

    fn state(holder: &str, balance: u64) -> TokenState {
        TokenState {
            balance,
            ..TokenState::empty("T", holder)
        }
    }

    #[tokio::test]
    async fn test_append_checks_head() {
        let store = MemoryStore::new();
        let mut batch = AppendBatch::new(0);
        batch.entries = vec![retract(1, 10)];
        batch.block = Some((10, "h10".to_string()));
        batch.provisional_height = Some(10);

        assert_eq!(store.append("T", &batch).await.expect("append"), 1);
        assert!(matches!(
            store.append("T", &batch).await,
            Err(StoreError::HeadMismatch {
                expected: 0,
                actual: 1
            })
        ));
        assert_eq!(store.head_seq("T").await.expect("head"), 1);
        assert_eq!(store.provisional_height("T").await.expect("h"), Some(10));
    }

    #[tokio::test]
    async fn test_append_block_window() {
        let store = MemoryStore::new();
        for height in 1..=5 {
            let mut batch = AppendBatch::new(0);
            batch.block = Some((height, format!("h{}", height)));
            batch.prune_blocks_below = Some(height.saturating_sub(2));
            store.append("T", &batch).await.expect("append");
        }
        let blocks = store.block_hashes("T").await.expect("blocks");
        assert_eq!(blocks.keys().copied().collect::<Vec<_>>(), vec![3, 4, 5]);

        let mut batch = AppendBatch::new(0);
        batch.drop_blocks_from = Some(4);
        store.append("T", &batch).await.expect("append");
        let blocks = store.block_hashes("T").await.expect("blocks");
        assert_eq!(blocks.keys().copied().collect::<Vec<_>>(), vec![3]);
    }

    #[tokio::test]
    async fn test_failed_commit_writes_nothing() {
        let store = MemoryStore::new();
        let commit = Commit::new(
            vec![state("A", 5)],
            None,
            Checkpoint {
                topic: "T".to_string(),
                last_height: 1,
                last_seq: 1,
                updated_at: Utc::now(),
            },
        );

        store.fail_next_commits(1);
        assert!(store.commit(&commit).await.is_err());
        assert!(store.load_checkpoint("T").await.expect("cp").is_none());
        assert!(store.load_state("T", "A").await.expect("state").is_none());

        store.commit(&commit).await.expect("commit");
        assert_eq!(
            store.load_state("T", "A").await.expect("state").map(|s| s.balance),
            Some(5)
        );
    }

    #[tokio::test]
    async fn test_replace_state_removes_holders() {
        let store = MemoryStore::new();
        let checkpoint = Checkpoint::genesis("T", 1);
        let mut commit = Commit::new(vec![state("A", 5), state("B", 1)], None, checkpoint);
        store.commit(&commit).await.expect("commit");

        commit.states = vec![state("A", 6)];
        store.replace_state(&commit).await.expect("replace");

        let states = store.load_states("T").await.expect("states");
        assert_eq!(states, vec![state("A", 6)]);
    }

    #[tokio::test]
    async fn test_commit_removes_holders() {
        let store = MemoryStore::new();
        let checkpoint = Checkpoint::genesis("T", 1);
        let commit = Commit::new(vec![state("A", 5), state("B", 1)], None, checkpoint.clone());
        store.commit(&commit).await.expect("commit");

        let commit = Commit::new(vec![state("A", 4)], None, checkpoint)
            .with_removed(vec!["B".to_string()]);
        store.commit(&commit).await.expect("commit");

        let states = store.load_states("T").await.expect("states");
        assert_eq!(states, vec![state("A", 4)]);
    }

    #[tokio::test]
    async fn test_commit_with_stolen_lease_writes_nothing() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(30);
        let guard = LeaseGuard {
            key: "lock:index:T".to_string(),
            owner: "a".to_string(),
        };
        assert!(store.acquire_lease(&guard.key, "a", ttl).await.expect("acquire"));

        let checkpoint = Checkpoint::genesis("T", 1).advanced(1, Some(1));
        let commit = Commit::new(vec![state("A", 5)], None, checkpoint)
            .with_lease(Some(guard.clone()));
        store.commit(&commit).await.expect("commit while held");

        // Another writer takes over after the lease lapses.
        assert!(store.release_lease(&guard.key, "a").await.expect("release"));
        assert!(store.acquire_lease(&guard.key, "b", ttl).await.expect("acquire"));

        let mut stale = commit.clone();
        stale.states = vec![state("A", 1)];
        stale.checkpoint = Checkpoint::genesis("T", 1).advanced(2, Some(2));
        assert!(matches!(
            store.commit(&stale).await,
            Err(StoreError::LeaseLost { ref key }) if key == "lock:index:T"
        ));
        assert!(matches!(
            store.replace_state(&stale).await,
            Err(StoreError::LeaseLost { .. })
        ));

        assert_eq!(
            store.load_checkpoint("T").await.expect("cp").map(|c| c.last_seq),
            Some(1)
        );
        assert_eq!(store.load_states("T").await.expect("states"), vec![state("A", 5)]);
    }

    #[tokio::test]
    async fn test_commit_with_expired_lease_is_refused() {
        let store = MemoryStore::new();
        let guard = LeaseGuard {
            key: "lock:index:T".to_string(),
            owner: "a".to_string(),
        };
        assert!(store
            .acquire_lease(&guard.key, "a", Duration::ZERO)
            .await
            .expect("acquire"));

        let commit = Commit::checkpoint_only(Checkpoint::genesis("T", 1)).with_lease(Some(guard));
        assert!(matches!(
            store.commit(&commit).await,
            Err(StoreError::LeaseLost { .. })
        ));
        assert!(store.load_checkpoint("T").await.expect("cp").is_none());
    }

    #[tokio::test]
    async fn test_lease_lifecycle() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(30);

        assert!(store.acquire_lease("lock", "a", ttl).await.expect("acquire"));
        assert!(!store.acquire_lease("lock", "b", ttl).await.expect("acquire"));
        assert!(store.renew_lease("lock", "a", ttl).await.expect("renew"));
        assert!(!store.renew_lease("lock", "b", ttl).await.expect("renew"));
        assert!(!store.release_lease("lock", "b").await.expect("release"));
        assert!(store.release_lease("lock", "a").await.expect("release"));
        assert!(store.acquire_lease("lock", "b", ttl).await.expect("acquire"));
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken() {
        let store = MemoryStore::new();
        assert!(store
            .acquire_lease("lock", "a", Duration::ZERO)
            .await
            .expect("acquire"));
        assert!(store
            .acquire_lease("lock", "b", Duration::from_secs(1))
            .await
            .expect("acquire"));
        assert!(!store
            .renew_lease("lock", "a", Duration::from_secs(1))
            .await
            .expect("renew"));
    }
}
