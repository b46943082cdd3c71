//! End-to-end chain following over the in-memory chain and store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use txoflow_indexer::error::{EXIT_CONSISTENCY, EXIT_FATAL};
use txoflow_indexer::{
    CacheStore, DurableStore, IndexerConfig, IndexerService, LeaseError, MemoryCache, MemoryStore,
};
use txoflow_listener::{ListenerConfig, ListenerError, ListenerService};
use txoflow_sdk::client::MemoryChainSource;
use txoflow_sdk::{
    BlockHeader, ChainClientConfig, ChainError, ChainSource, RawBlock, Transaction,
};

const TOPIC: &str = "T";
const START: u64 = 10;

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

/// A chain source whose block fetches take longer than a lease renewal period.
struct SlowSource {
    inner: Arc<MemoryChainSource>,
    delay: Duration,
}

#[async_trait]
impl ChainSource for SlowSource {
    async fn chain_tip(&self) -> Result<BlockHeader, ChainError> {
        self.inner.chain_tip().await
    }

    async fn block_header(&self, height: u64) -> Result<Option<BlockHeader>, ChainError> {
        self.inner.block_header(height).await
    }

    async fn block(&self, topic: &str, height: u64) -> Result<Option<RawBlock>, ChainError> {
        tokio::time::sleep(self.delay).await;
        self.inner.block(topic, height).await
    }

    async fn fetch_tx(&self, txid: &str) -> Result<Transaction, ChainError> {
        self.inner.fetch_tx(txid).await
    }
}

fn config() -> ListenerConfig {
    ListenerConfig::new(TOPIC)
        .with_start_height(START)
        .with_backoff(1, 2.0, 10)
}

fn client() -> ChainClientConfig {
    ChainClientConfig::default()
        .with_poll_interval(Duration::from_millis(5))
        .with_backoff(Duration::from_millis(1), 2.0, Duration::from_millis(10))
}

fn listener(
    source: &Arc<MemoryChainSource>,
    store: &Arc<MemoryStore>,
    config: ListenerConfig,
) -> Arc<ListenerService> {
    Arc::new(
        ListenerService::new(
            config,
            client(),
            Arc::clone(source) as Arc<dyn ChainSource>,
            Arc::clone(store) as Arc<dyn DurableStore>,
        )
        .expect("listener"),
    )
}

fn spawn(service: &Arc<ListenerService>) -> JoinHandle<Result<(), ListenerError>> {
    let service = Arc::clone(service);
    tokio::spawn(async move { service.run().await })
}

async fn stop(service: &ListenerService, handle: JoinHandle<Result<(), ListenerError>>) {
    service.stop();
    handle.await.expect("join").expect("listener run");
}

/// Waits until `cond` holds.
async fn wait_for(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for the listener");
}

async fn window(store: &MemoryStore) -> Vec<(u64, String)> {
    store
        .block_hashes(TOPIC)
        .await
        .expect("window")
        .into_iter()
        .collect()
}

/// Folds the whole log with an indexer and returns the non-empty balances.
async fn fold(store: &Arc<MemoryStore>) -> Vec<(String, u64)> {
    let cache = Arc::new(MemoryCache::new());
    let indexer = IndexerService::new(
        IndexerConfig::new(TOPIC).with_start_height(START),
        Arc::clone(store) as Arc<dyn DurableStore>,
        Arc::clone(&cache) as Arc<dyn CacheStore>,
    )
    .expect("indexer");

    let mut checkpoint = indexer.open().await.expect("open");
    loop {
        let outcome = indexer.poll_once(&checkpoint).await.expect("poll");
        checkpoint = outcome.checkpoint;
        if outcome.consumed == 0 {
            break;
        }
    }

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

#[tokio::test]
async fn test_follows_chain_in_order() {
    let source = Arc::new(MemoryChainSource::new(START));
    let store = Arc::new(MemoryStore::new());
    let m = mint("A", 150);
    let t1 = transfer("A", "B", 100);
    let t2 = transfer("B", "C", 50);
    source.push_block("a", &[Some(m.as_str())]);
    source.push_block("b", &[Some(t1.as_str()), Some(t2.as_str())]);

    let svc = listener(&source, &store, config());
    let handle = spawn(&svc);
    wait_for(|| store.log(TOPIC).len() == 3).await;
    stop(&svc, handle).await;

    let log = store.log(TOPIC);
    assert_eq!(log.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
    let positions: Vec<(u64, u64)> = log
        .iter()
        .filter_map(|e| e.op.event())
        .map(|e| e.position())
        .collect();
    assert_eq!(positions, vec![(10, 0), (11, 0), (11, 1)]);
    assert_eq!(
        window(&store).await,
        vec![(10, "a".to_string()), (11, "b".to_string())]
    );
    assert_eq!(store.provisional_height(TOPIC).await.expect("height"), Some(11));
    assert_eq!(svc.metrics().blocks_appended(), 2);
    assert_eq!(fold(&store).await, owned(&[("A", 50), ("B", 50), ("C", 50)]));
}

#[tokio::test]
async fn test_reorg_retracts_and_reingests() {
    let source = Arc::new(MemoryChainSource::new(START));
    let store = Arc::new(MemoryStore::new());
    let m = mint("A", 150);
    let t1 = transfer("A", "B", 100);
    let t2 = transfer("B", "C", 50);
    let t3 = transfer("A", "C", 10);
    source.push_block("a", &[Some(m.as_str())]);
    source.push_block("b", &[Some(t1.as_str())]);
    source.push_block("c", &[Some(t2.as_str())]);

    let svc = listener(&source, &store, config());
    let handle = spawn(&svc);
    wait_for(|| store.log(TOPIC).len() == 3).await;

    // Heights 11 and 12 are replaced by a longer branch.
    source.truncate(11);
    source.push_block("b2", &[Some(t3.as_str())]);
    source.push_block("c2", &[]);
    source.push_block("d2", &[]);

    wait_for(|| svc.metrics().last_height() == 13).await;
    stop(&svc, handle).await;

    let log = store.log(TOPIC);
    assert_eq!(log.len(), 5);
    assert!(log[3].op.is_retract());
    assert_eq!(log[4].op.event().map(|e| e.txid.as_str()), Some("b2-0"));
    assert_eq!(
        window(&store).await,
        vec![
            (10, "a".to_string()),
            (11, "b2".to_string()),
            (12, "c2".to_string()),
            (13, "d2".to_string()),
        ]
    );
    assert_eq!(svc.metrics().retractions(), 1);
    assert_eq!(fold(&store).await, owned(&[("A", 140), ("C", 10)]));
}

#[tokio::test]
async fn test_restart_skips_redelivered_blocks() {
    let source = Arc::new(MemoryChainSource::new(START));
    let store = Arc::new(MemoryStore::new());
    let m = mint("A", 150);
    let t1 = transfer("A", "B", 100);
    source.push_block("a", &[Some(m.as_str())]);
    source.push_block("b", &[Some(t1.as_str())]);

    let first = listener(&source, &store, config());
    let handle = spawn(&first);
    wait_for(|| store.log(TOPIC).len() == 2).await;
    stop(&first, handle).await;

    // No indexer progress yet, so the restart replays from the start height.
    let second = listener(&source, &store, config());
    assert_eq!(second.resume_height().await.expect("height"), START);

    let t2 = transfer("B", "C", 40);
    source.push_block("c", &[Some(t2.as_str())]);
    let handle = spawn(&second);
    wait_for(|| store.log(TOPIC).len() == 3).await;
    stop(&second, handle).await;

    let log = store.log(TOPIC);
    assert_eq!(log.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(second.metrics().blocks_skipped(), 2);
    assert_eq!(fold(&store).await, owned(&[("A", 50), ("B", 60), ("C", 40)]));
}

#[tokio::test]
async fn test_lite_transactions_are_fetched() {
    let source = Arc::new(MemoryChainSource::new(START));
    let store = Arc::new(MemoryStore::new());
    source.push_block("a", &[None, None]);
    source.insert_transaction(Transaction {
        id: "a-0".to_string(),
        block_height: Some(START),
        payload: Some(mint("A", 10)),
    });

    let svc = listener(&source, &store, config().with_batch_size(2));
    let handle = spawn(&svc);
    wait_for(|| svc.metrics().blocks_appended() == 1).await;
    stop(&svc, handle).await;

    let log = store.log(TOPIC);
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].op.event().map(|e| e.txid.as_str()), Some("a-0"));
    assert_eq!(svc.metrics().txs_missing(), 1);
}

#[tokio::test]
async fn test_reorg_below_window_is_fatal() {
    let source = Arc::new(MemoryChainSource::new(START));
    let store = Arc::new(MemoryStore::new());
    for hash in ["a", "b", "c", "d"] {
        source.push_block(hash, &[]);
    }

    let svc = listener(&source, &store, config().with_block_window(2));
    let handle = spawn(&svc);
    wait_for(|| svc.metrics().last_height() == 13).await;

    source.truncate(11);
    for hash in ["b2", "c2", "d2", "e2"] {
        source.push_block(hash, &[]);
    }

    let err = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("listener should stop")
        .expect("join")
        .expect_err("reorg too deep");
    assert!(matches!(err, ListenerError::ReorgTooDeep { floor: 12, .. }));
    assert_eq!(err.exit_code(), EXIT_CONSISTENCY);
    assert!(!svc.is_running());
}

#[tokio::test]
async fn test_second_listener_is_refused() {
    let source = Arc::new(MemoryChainSource::new(START));
    let store = Arc::new(MemoryStore::new());

    let first = listener(&source, &store, config().with_owner("first"));
    let handle = spawn(&first);
    wait_for(|| first.is_running()).await;

    let second = listener(&source, &store, config().with_owner("second"));
    let err = second.run().await.expect_err("lease held");
    assert!(matches!(err, ListenerError::Lease(LeaseError::Held { .. })));
    assert_eq!(err.exit_code(), EXIT_FATAL);

    stop(&first, handle).await;
}

#[tokio::test]
async fn test_upstream_outage_reconnects() {
    let source = Arc::new(MemoryChainSource::new(START));
    let store = Arc::new(MemoryStore::new());
    let m = mint("A", 5);
    source.push_block("a", &[Some(m.as_str())]);
    // Enough failures to exhaust the subscription retries once.
    source.fail_next(7);

    let svc = listener(&source, &store, config());
    let handle = spawn(&svc);
    wait_for(|| store.log(TOPIC).len() == 1).await;
    stop(&svc, handle).await;

    assert!(svc.metrics().reconnects() >= 1);
    assert_eq!(fold(&store).await, owned(&[("A", 5)]));
}

#[tokio::test]
async fn test_slow_block_fetch_outlasts_lease_renewals() {
    let inner = Arc::new(MemoryChainSource::new(START));
    let store = Arc::new(MemoryStore::new());
    let m = mint("A", 150);
    inner.push_block("a", &[Some(m.as_str())]);
    let source = Arc::new(SlowSource {
        inner,
        delay: Duration::from_millis(300),
    });

    // Renewals every 100ms, three per block fetch.
    let svc = Arc::new(
        ListenerService::new(
            config().with_lease_ttl(300),
            client(),
            source as Arc<dyn ChainSource>,
            Arc::clone(&store) as Arc<dyn DurableStore>,
        )
        .expect("listener"),
    );
    let handle = spawn(&svc);
    wait_for(|| svc.metrics().blocks_appended() == 1).await;
    assert!(svc.is_running());
    stop(&svc, handle).await;

    assert_eq!(store.log(TOPIC).len(), 1);
    assert_eq!(fold(&store).await, owned(&[("A", 150)]));
}

#[tokio::test]
async fn test_unreachable_upstream_surfaces_disconnect() {
    let source = Arc::new(MemoryChainSource::new(START));
    let store = Arc::new(MemoryStore::new());
    source.push_block("a", &[]);
    source.fail_next(u32::MAX);

    // The retry budget of one read (20 + 40 + 80ms) spans several renewals.
    let client = client()
        .with_max_retries(3)
        .with_backoff(Duration::from_millis(20), 2.0, Duration::from_millis(80));
    let svc = ListenerService::new(
        config().with_lease_ttl(150).with_max_reconnects(0),
        client,
        Arc::clone(&source) as Arc<dyn ChainSource>,
        Arc::clone(&store) as Arc<dyn DurableStore>,
    )
    .expect("listener");

    let err = tokio::time::timeout(Duration::from_secs(5), svc.run())
        .await
        .expect("listener should give up")
        .expect_err("disconnected");
    assert!(matches!(
        err,
        ListenerError::Chain(ChainError::Disconnected { attempts: 4, .. })
    ));
    assert_eq!(err.exit_code(), EXIT_FATAL);
    assert!(!svc.is_running());
    assert!(store.log(TOPIC).is_empty());
}

#[tokio::test]
async fn test_lost_lease_stops_pending_read() {
    let inner = Arc::new(MemoryChainSource::new(START));
    let store = Arc::new(MemoryStore::new());
    inner.push_block("a", &[]);
    let source = Arc::new(SlowSource {
        inner,
        delay: Duration::from_secs(60),
    });

    let svc = Arc::new(
        ListenerService::new(
            config().with_lease_ttl(150).with_owner("first"),
            client(),
            source as Arc<dyn ChainSource>,
            Arc::clone(&store) as Arc<dyn DurableStore>,
        )
        .expect("listener"),
    );
    let handle = spawn(&svc);
    wait_for(|| svc.is_running()).await;

    // Another listener takes over while the first is waiting on the chain.
    assert!(store
        .release_lease("lock:listener:T", "first")
        .await
        .expect("release"));
    assert!(store
        .acquire_lease("lock:listener:T", "second", Duration::from_secs(30))
        .await
        .expect("acquire"));

    let err = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("listener should stop")
        .expect("join")
        .expect_err("lease lost");
    assert!(matches!(err, ListenerError::Lease(LeaseError::Lost { .. })));
    assert_eq!(err.exit_code(), EXIT_FATAL);
    assert!(store.log(TOPIC).is_empty());
}
