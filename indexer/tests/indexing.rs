//! End-to-end indexing over the in-memory stores.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use txoflow_indexer::error::EXIT_CONSISTENCY;
use txoflow_indexer::{
    AppendBatch, CacheStore, ConsistencyError, DurableStore, IndexerConfig, IndexerError,
    IndexerService, LeaseError, MemoryCache, MemoryStore,
};
use txoflow_sdk::{Checkpoint, Event, LogEntry, TokenState};

const TOPIC: &str = "T";
const START: u64 = 811_302;

fn mint(to: &str, amt: u64) -> String {
    format!(
        r#"{{"p":"bsv-20","op":"deploy+mint","amt":"{}","to":"{}","sym":"TKN","dec":"0"}}"#,
        amt, to
    )
}

fn transfer(from: &str, to: &str, amt: u64) -> String {
    format!(
        r#"{{"p":"bsv-20","op":"transfer","amt":"{}","from":"{}","to":"{}"}}"#,
        amt, from, to
    )
}

/// Appends entries to the log the way the listener would.
struct LogWriter {
    store: Arc<MemoryStore>,
    tx: u64,
}

impl LogWriter {
    fn new(store: &Arc<MemoryStore>) -> Self {
        Self {
            store: Arc::clone(store),
            tx: 0,
        }
    }

    async fn events(&mut self, events: &[(u64, String)]) {
        let head = self.store.head_seq(TOPIC).await.expect("head");
        let mut batch = AppendBatch::new(head);
        for (i, (height, payload)) in events.iter().enumerate() {
            self.tx += 1;
            let event = Event {
                seq: 0,
                height: *height,
                idx: i as u64,
                txid: format!("tx{}", self.tx),
                topic: TOPIC.to_string(),
                payload: payload.clone(),
                timestamp: Utc::now(),
            };
            batch
                .entries
                .push(LogEntry::append(head + i as u64 + 1, event));
        }
        self.store.append(TOPIC, &batch).await.expect("append");
    }

    async fn retract(&mut self, height: u64) {
        let head = self.store.head_seq(TOPIC).await.expect("head");
        let mut batch = AppendBatch::new(head);
        batch.entries.push(LogEntry::retract(head + 1, height, None));
        batch.drop_blocks_from = Some(height);
        batch.provisional_height = Some(height - 1);
        self.store.append(TOPIC, &batch).await.expect("append");
    }
}

fn config() -> IndexerConfig {
    IndexerConfig::new(TOPIC)
        .with_start_height(START)
        .with_poll_interval(5)
        .with_backoff(1, 2.0, 10)
}

fn service(
    store: &Arc<MemoryStore>,
    cache: &Arc<MemoryCache>,
    config: IndexerConfig,
) -> IndexerService {
    IndexerService::new(
        config,
        Arc::clone(store) as Arc<dyn DurableStore>,
        Arc::clone(cache) as Arc<dyn CacheStore>,
    )
    .expect("service")
}

/// Polls until the log is exhausted.
async fn drain(svc: &IndexerService) -> Checkpoint {
    let mut checkpoint = svc.open().await.expect("open");
    loop {
        let outcome = svc.poll_once(&checkpoint).await.expect("poll");
        checkpoint = outcome.checkpoint;
        if outcome.consumed == 0 {
            return checkpoint;
        }
    }
}

async fn balances(store: &MemoryStore) -> Vec<(String, u64)> {
    store
        .load_states(TOPIC)
        .await
        .expect("states")
        .into_iter()
        .filter(|s| !s.is_empty())
        .map(|s| (s.holder, s.balance))
        .collect()
}

fn owned(pairs: &[(&str, u64)]) -> Vec<(String, u64)> {
    pairs.iter().map(|(h, b)| (h.to_string(), *b)).collect()
}

async fn scenario_log(store: &Arc<MemoryStore>) {
    let mut log = LogWriter::new(store);
    log.events(&[(START, mint("A", 150)), (START, transfer("A", "B", 100))])
        .await;
    log.events(&[(START + 1, transfer("B", "C", 50))]).await;
    log.events(&[(START + 2, transfer("C", "A", 20))]).await;
}

#[tokio::test]
async fn test_folds_transfer_scenario() {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::new());
    scenario_log(&store).await;

    let svc = service(&store, &cache, config());
    let checkpoint = drain(&svc).await;

    assert_eq!(checkpoint.last_seq, 4);
    assert_eq!(checkpoint.last_height, START + 2);
    assert_eq!(
        balances(&store).await,
        owned(&[("A", 70), ("B", 50), ("C", 30)])
    );
    let info = store.load_token_info(TOPIC).await.expect("info").expect("deployed");
    assert_eq!(info.supply, 150);
    assert_eq!(
        cache.get_state(TOPIC, "C").await.expect("get").map(|s| s.balance),
        Some(30)
    );
}

#[tokio::test]
async fn test_small_batches_match_single_batch() {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::new());
    scenario_log(&store).await;

    let svc = service(&store, &cache, config().with_batch_size(1));
    let checkpoint = drain(&svc).await;

    assert_eq!(checkpoint.last_seq, 4);
    assert_eq!(
        balances(&store).await,
        owned(&[("A", 70), ("B", 50), ("C", 30)])
    );
    assert_eq!(svc.metrics().commits(), 4);
}

#[tokio::test]
async fn test_malformed_event_is_skipped() {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::new());
    let mut log = LogWriter::new(&store);
    log.events(&[
        (START, mint("A", 150)),
        (START, transfer("A", "B", 10)),
        (START, transfer("A", "B", 10)),
        (START, transfer("A", "B", 10)),
        (START + 1, "{\"op\":\"transfer\",\"amt\":\"x\"".to_string()),
        (START + 1, transfer("B", "C", 5)),
    ])
    .await;

    let svc = service(&store, &cache, config());
    let checkpoint = drain(&svc).await;

    let seqs: Vec<u64> = store.log(TOPIC).iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(checkpoint.last_seq, 6);
    assert_eq!(svc.metrics().decode_skipped(), 1);
    assert_eq!(
        balances(&store).await,
        owned(&[("A", 120), ("B", 25), ("C", 5)])
    );
}

#[tokio::test]
async fn test_retraction_refolds_state() {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::new());
    let mut log = LogWriter::new(&store);
    log.events(&[(START, mint("A", 150))]).await;
    log.events(&[(START + 1, transfer("A", "B", 100))]).await;

    let svc = service(&store, &cache, config());
    drain(&svc).await;
    assert_eq!(balances(&store).await, owned(&[("A", 50), ("B", 100)]));

    log.retract(START + 1).await;
    log.events(&[(START + 1, transfer("A", "C", 30))]).await;
    let checkpoint = drain(&svc).await;

    assert_eq!(checkpoint.last_seq, 4);
    assert_eq!(checkpoint.last_height, START + 1);
    assert_eq!(balances(&store).await, owned(&[("A", 120), ("C", 30)]));
    assert_eq!(cache.get_state(TOPIC, "B").await.expect("get"), None);
    assert_eq!(svc.metrics().retractions(), 1);
}

#[tokio::test]
async fn test_rebuild_equals_incremental() {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::new());
    scenario_log(&store).await;
    let mut log = LogWriter::new(&store);
    log.retract(START + 2).await;
    log.events(&[(START + 2, transfer("B", "D", 10))]).await;

    let svc = service(&store, &cache, config());
    let incremental = drain(&svc).await;
    let states: Vec<TokenState> = store.load_states(TOPIC).await.expect("states");
    let info = store.load_token_info(TOPIC).await.expect("info");

    let rebuilt = svc.rebuild().await.expect("rebuild");

    assert_eq!(rebuilt.last_seq, incremental.last_seq);
    assert_eq!(rebuilt.last_height, incremental.last_height);
    assert_eq!(store.load_states(TOPIC).await.expect("states"), states);
    assert_eq!(store.load_token_info(TOPIC).await.expect("info"), info);
    assert_eq!(
        balances(&store).await,
        owned(&[("A", 50), ("B", 40), ("C", 50), ("D", 10)])
    );
}

#[tokio::test]
async fn test_failed_commit_leaves_no_trace() {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::new());
    scenario_log(&store).await;

    let svc = service(&store, &cache, config());
    let checkpoint = svc.open().await.expect("open");
    store.fail_next_commits(1);
    let err = svc.poll_once(&checkpoint).await.expect_err("injected");
    assert!(err.is_transient());

    assert_eq!(store.load_checkpoint(TOPIC).await.expect("cp"), None);
    assert!(store.load_states(TOPIC).await.expect("states").is_empty());
    assert!(cache.is_empty());

    // A fresh process converges to the same state.
    let restarted = service(&store, &cache, config());
    let checkpoint = drain(&restarted).await;
    assert_eq!(checkpoint.last_seq, 4);
    assert_eq!(
        balances(&store).await,
        owned(&[("A", 70), ("B", 50), ("C", 30)])
    );
}

#[tokio::test]
async fn test_failed_refold_is_retried() {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::new());
    let mut log = LogWriter::new(&store);
    log.events(&[(START, mint("A", 150)), (START + 1, transfer("A", "B", 100))])
        .await;
    log.retract(START + 1).await;

    let svc = service(&store, &cache, config().with_batch_size(2));
    let checkpoint = svc.open().await.expect("open");
    let first = svc.poll_once(&checkpoint).await.expect("poll");
    assert_eq!(first.checkpoint.last_seq, 2);

    store.fail_next_commits(1);
    assert!(svc.poll_once(&first.checkpoint).await.is_err());
    assert_eq!(
        store.load_checkpoint(TOPIC).await.expect("cp").map(|c| c.last_seq),
        Some(2)
    );

    let checkpoint = drain(&svc).await;
    assert_eq!(checkpoint.last_seq, 3);
    assert_eq!(checkpoint.last_height, START);
    assert_eq!(balances(&store).await, owned(&[("A", 150)]));
}

#[tokio::test]
async fn test_cache_outage_then_rebuild_cache() {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::new());
    scenario_log(&store).await;

    cache.set_reachable(false);
    let svc = service(&store, &cache, config());
    let checkpoint = drain(&svc).await;
    assert_eq!(checkpoint.last_seq, 4);
    assert!(svc.metrics().cache_failures() > 0);

    cache.set_reachable(true);
    assert!(cache.is_empty());

    let holders = svc.rebuild_cache().await.expect("rebuild cache");
    assert_eq!(holders, 3);
    for state in store.load_states(TOPIC).await.expect("states") {
        let cached = cache.get_state(TOPIC, &state.holder).await.expect("get");
        assert_eq!(cached, Some(state));
    }
}

#[tokio::test]
async fn test_checkpoint_ahead_of_log_is_fatal() {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::new());
    let mut log = LogWriter::new(&store);
    log.events(&[(START, mint("A", 150))]).await;
    store.put_checkpoint(Checkpoint::genesis(TOPIC, START).advanced(9, Some(START)));

    let svc = service(&store, &cache, config());
    let err = svc.run().await.expect_err("ahead");

    assert!(matches!(
        err,
        IndexerError::Consistency(ConsistencyError::CheckpointAhead {
            checkpoint: 9,
            head: 1
        })
    ));
    assert_eq!(err.exit_code(), EXIT_CONSISTENCY);
}

#[tokio::test]
async fn test_run_retries_transient_failures() {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::new());
    scenario_log(&store).await;
    store.fail_next_commits(2);

    let svc = Arc::new(service(&store, &cache, config()));
    let runner = Arc::clone(&svc);
    let handle = tokio::spawn(async move { runner.run().await });

    for _ in 0..200 {
        if svc.metrics().commits() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    svc.stop();
    handle.await.expect("join").expect("run");

    assert_eq!(svc.metrics().commit_failures(), 2);
    assert_eq!(
        balances(&store).await,
        owned(&[("A", 70), ("B", 50), ("C", 30)])
    );
}

#[tokio::test]
async fn test_second_indexer_is_refused() {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::new());
    assert!(store
        .acquire_lease("lock:index:T", "other", Duration::from_secs(30))
        .await
        .expect("lease"));

    let svc = service(&store, &cache, config());
    let err = svc.run().await.expect_err("held");

    assert!(matches!(err, IndexerError::Lease(LeaseError::Held { .. })));
    assert!(!svc.is_running());
}

#[tokio::test]
async fn test_run_stops_when_lease_taken_over() {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::new());
    scenario_log(&store).await;

    let svc = Arc::new(service(&store, &cache, config().with_owner("first")));
    let runner = Arc::clone(&svc);
    let handle = tokio::spawn(async move { runner.run().await });

    for _ in 0..200 {
        if svc.metrics().last_seq() == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(svc.metrics().last_seq(), 4);

    // Another indexer takes the lease while this one is still polling.
    assert!(store
        .release_lease("lock:index:T", "first")
        .await
        .expect("release"));
    assert!(store
        .acquire_lease("lock:index:T", "second", Duration::from_secs(30))
        .await
        .expect("acquire"));
    LogWriter::new(&store)
        .events(&[(START + 3, transfer("A", "D", 5))])
        .await;

    let err = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("indexer should stop")
        .expect("join")
        .expect_err("lease lost");
    assert!(matches!(err, IndexerError::Lease(LeaseError::Lost { .. })));
    assert!(!svc.is_running());

    let checkpoint = store.load_checkpoint(TOPIC).await.expect("cp").expect("checkpoint");
    assert_eq!(checkpoint.last_seq, 4);
    assert_eq!(
        balances(&store).await,
        owned(&[("A", 70), ("B", 50), ("C", 30)])
    );
    // The new owner keeps its lease.
    assert!(store
        .renew_lease("lock:index:T", "second", Duration::from_secs(30))
        .await
        .expect("renew"));
}
