//! Main listener service.
//!
//! Follows the chain for one topic and appends every block's matching
//! transactions to the durable log. The service cycles through
//! `Disconnected -> Subscribing -> Streaming`; after an error it falls back
//! to `Disconnected` and resumes from durable state, never from the point
//! of failure.
//!
//! Lease renewal and progress reports run on a separate housekeeping task,
//! so a slow block fetch is never interrupted by a timer. Only a stop
//! request or a lost lease cancel a pending read.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{oneshot, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use txoflow_indexer::{DurableStore, Lease, LeaseError};
use txoflow_sdk::{
    BlockHeader, ChainClientConfig, ChainError, ChainSource, RawBlockEvent, RawTransaction,
    Subscription,
};

use super::appender::Appender;
use super::builder::EventBuilder;
use super::config::ListenerConfig;
use super::error::ListenerError;
use super::metrics::ListenerMetrics;
use super::reorg::{BlockCheck, ReorgDetector};

/// Lease role of the listener.
pub const LEASE_ROLE: &str = "listener";

/// Connection state of the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// No subscription; the resume height is read from durable state next.
    Disconnected,
    /// About to subscribe from the given height.
    Subscribing(u64),
    /// Consuming the subscription.
    Streaming,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Subscribing(height) => write!(f, "subscribing({})", height),
            Self::Streaming => write!(f, "streaming"),
        }
    }
}

/// What woke the streaming loop.
enum Wake {
    Stop,
    LeaseLost(LeaseError),
    Item(Result<RawBlockEvent, ChainError>),
}

/// Per-subscription state.
struct Follower {
    subscription: Subscription,
    appender: Appender,
    pending: Vec<RawTransaction>,
}

/// The listener service.
pub struct ListenerService {
    /// Configuration.
    config: ListenerConfig,

    /// Chain client settings.
    client: ChainClientConfig,

    /// Upstream chain source.
    source: Arc<dyn ChainSource>,

    /// Durable store.
    store: Arc<dyn DurableStore>,

    /// Event builder.
    builder: EventBuilder,

    /// Fork detector.
    detector: ReorgDetector,

    /// Metrics.
    metrics: Arc<ListenerMetrics>,

    /// Single-writer lease, shared with the housekeeping task.
    lease: Arc<Lease>,

    /// Whether the service is running.
    running: Arc<AtomicBool>,

    /// Wakes the loop on stop.
    shutdown: Arc<Notify>,
}

impl ListenerService {
    /// Creates a new listener service.
    ///
    /// # Errors
    ///
    /// Returns an error if either configuration is invalid.
    pub fn new(
        config: ListenerConfig,
        client: ChainClientConfig,
        source: Arc<dyn ChainSource>,
        store: Arc<dyn DurableStore>,
    ) -> Result<Self, ListenerError> {
        config.validate()?;
        client.validate()?;

        let metrics = Arc::new(ListenerMetrics::new());
        let builder = EventBuilder::new(
            Arc::clone(&source),
            client.clone(),
            config.topic.clone(),
            config.batch_size,
            Arc::clone(&metrics),
        );
        let detector = ReorgDetector::new(Arc::clone(&source), client.clone(), config.start_height);
        let lease = Arc::new(Lease::new(
            Arc::clone(&store),
            LEASE_ROLE,
            &config.topic,
            config.owner.clone(),
            config.lease_ttl(),
        ));

        Ok(Self {
            config,
            client,
            source,
            store,
            builder,
            detector,
            metrics,
            lease,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Returns the metrics.
    #[must_use]
    pub fn metrics(&self) -> Arc<ListenerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Returns true if the service is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stops the service. A block being appended is finished first.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.shutdown.notify_one();
        info!("Listener stop requested");
    }

    fn topic(&self) -> &str {
        &self.config.topic
    }

    /// Returns the height to subscribe from, derived from durable state.
    ///
    /// Starts at the indexer checkpoint height (or the start height), but
    /// never above the first height the log has not covered yet.
    ///
    /// # Errors
    ///
    /// Returns store failures.
    pub async fn resume_height(&self) -> Result<u64, ListenerError> {
        let start = self.config.start_height;
        let checkpoint = self.store.load_checkpoint(self.topic()).await?;
        let mut height = checkpoint.map_or(start, |cp| cp.resume_height(start));
        if let Some(provisional) = self.store.provisional_height(self.topic()).await? {
            height = height.min(provisional.saturating_add(1));
        }
        Ok(height.max(start))
    }

    /// Runs the listener until stopped.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that stopped the loop.
    pub async fn run(&self) -> Result<(), ListenerError> {
        self.lease.acquire().await?;
        self.running.store(true, Ordering::Relaxed);
        info!(
            topic = %self.topic(),
            id = %self.config.indexer_id,
            "Listener service started"
        );

        let (lost_tx, mut lost_rx) = oneshot::channel();
        let keeper = tokio::spawn(housekeeping(
            Arc::clone(&self.lease),
            Arc::clone(&self.metrics),
            self.config.clone(),
            lost_tx,
        ));

        let result = self.run_loop(&mut lost_rx).await;

        keeper.abort();
        let _ = keeper.await;
        self.running.store(false, Ordering::Relaxed);
        self.lease.release().await;
        match &result {
            Ok(()) => info!("Listener service stopped"),
            Err(e) => error!("Listener service failed: {}", e),
        }
        result
    }

    async fn run_loop(
        &self,
        lease_lost: &mut oneshot::Receiver<LeaseError>,
    ) -> Result<(), ListenerError> {
        let mut state = ListenerState::Disconnected;
        let mut follower: Option<Follower> = None;
        let mut reconnects = 0u32;
        let mut progress_mark = self.progress();

        while self.is_running() {
            match lease_lost.try_recv() {
                Ok(e) => return Err(e.into()),
                Err(oneshot::error::TryRecvError::Closed) => return Err(self.lost_lease().into()),
                Err(oneshot::error::TryRecvError::Empty) => {}
            }

            let result = match state {
                ListenerState::Disconnected => {
                    follower = None;
                    self.resume_height().await.map(ListenerState::Subscribing)
                }
                ListenerState::Subscribing(height) => match self.subscribe(height).await {
                    Ok(active) => {
                        follower = Some(active);
                        Ok(ListenerState::Streaming)
                    }
                    Err(e) => Err(e),
                },
                ListenerState::Streaming => match follower.as_mut() {
                    Some(active) => self
                        .stream(active, lease_lost)
                        .await
                        .map(|()| ListenerState::Streaming),
                    None => Ok(ListenerState::Disconnected),
                },
            };

            match result {
                Ok(next) => {
                    state = next;
                    if reconnects > 0 && self.progress() > progress_mark {
                        debug!("listener recovered after {} reconnects", reconnects);
                        reconnects = 0;
                    }
                }
                Err(e) if e.is_reconnectable() && reconnects < self.config.max_reconnects => {
                    let wait = self.config.backoff(reconnects);
                    reconnects += 1;
                    progress_mark = self.progress();
                    self.metrics.record_reconnect();
                    warn!(
                        attempt = reconnects,
                        wait_ms = wait.as_millis() as u64,
                        "listener disconnected: {}",
                        e
                    );
                    tokio::time::sleep(wait).await;
                    state = ListenerState::Disconnected;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Blocks, skips and retractions handled so far.
    fn progress(&self) -> u64 {
        self.metrics.blocks_appended() + self.metrics.blocks_skipped() + self.metrics.retractions()
    }

    /// Opens a subscription from `height` on top of the current log head.
    async fn subscribe(&self, height: u64) -> Result<Follower, ListenerError> {
        let mut appender = Appender::new(
            Arc::clone(&self.store),
            self.config.clone(),
            Arc::clone(&self.metrics),
        );
        let head = appender.open().await?;
        info!(topic = %self.topic(), height, head, "Subscribing from block {}", height);

        Ok(Follower {
            subscription: Subscription::new(
                Arc::clone(&self.source),
                self.client.clone(),
                self.config.topic.clone(),
                height,
            ),
            appender,
            pending: Vec::new(),
        })
    }

    fn lost_lease(&self) -> LeaseError {
        LeaseError::Lost {
            key: self.lease.key().to_string(),
        }
    }

    /// Waits for the next item and handles it, unless a stop request or a
    /// lost lease comes first.
    async fn stream(
        &self,
        follower: &mut Follower,
        lease_lost: &mut oneshot::Receiver<LeaseError>,
    ) -> Result<(), ListenerError> {
        let wake = tokio::select! {
            () = self.shutdown.notified() => Wake::Stop,
            lost = &mut *lease_lost => Wake::LeaseLost(lost.unwrap_or_else(|_| self.lost_lease())),
            item = follower.subscription.next() => Wake::Item(item),
        };

        match wake {
            Wake::Stop => Ok(()),
            Wake::LeaseLost(e) => Err(e.into()),
            Wake::Item(item) => self.handle(follower, item?).await,
        }
    }

    /// Handles one subscription item.
    async fn handle(&self, follower: &mut Follower, item: RawBlockEvent) -> Result<(), ListenerError> {
        match item {
            RawBlockEvent::Transaction(tx) => {
                follower.pending.push(tx);
                Ok(())
            }
            RawBlockEvent::BlockDone(header) => {
                let txs = std::mem::take(&mut follower.pending);
                self.handle_block(follower, &header, txs).await
            }
        }
    }

    /// Appends a completed block, skips it, or handles a fork.
    async fn handle_block(
        &self,
        follower: &mut Follower,
        header: &BlockHeader,
        txs: Vec<RawTransaction>,
    ) -> Result<(), ListenerError> {
        let window = self.store.block_hashes(self.topic()).await?;
        let provisional = self.store.provisional_height(self.topic()).await?;

        match ReorgDetector::check(header, &window, provisional) {
            BlockCheck::Redelivered => {
                debug!(height = header.height, "skipping re-delivered block");
                self.metrics.record_skipped_block();
                Ok(())
            }
            BlockCheck::Extends => {
                let events = self.builder.build_block(txs).await?;
                follower.appender.append_block(header, events).await?;
                Ok(())
            }
            BlockCheck::Conflict => match self.detector.find_fork(header, &window).await? {
                Some(fork) => {
                    follower
                        .appender
                        .retract(fork.height, fork.block_hash.clone())
                        .await?;
                    follower.subscription.resubscribe(fork.height);
                    Ok(())
                }
                None => {
                    let height = provisional.map_or(header.height, |p| p.saturating_add(1));
                    warn!(
                        height = header.height,
                        resume = height,
                        "conflicting block but no divergence in the window"
                    );
                    follower.subscription.resubscribe(height);
                    Ok(())
                }
            },
        }
    }
}

/// Renews the lease and reports progress on every tick.
///
/// Transient renewal failures are retried on the next tick; the lease
/// outlives two missed renewals. Any other failure is sent on `lost` and
/// ends the task.
async fn housekeeping(
    lease: Arc<Lease>,
    metrics: Arc<ListenerMetrics>,
    config: ListenerConfig,
    lost: oneshot::Sender<LeaseError>,
) {
    let mut ticker = tokio::time::interval(config.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut last_report = Instant::now();

    loop {
        ticker.tick().await;
        if last_report.elapsed() >= config.progress_interval() {
            report_progress(&metrics, last_report);
            last_report = Instant::now();
        }
        match lease.renew().await {
            Ok(()) => {}
            Err(e) if e.is_transient() => warn!("lease renewal failed: {}", e),
            Err(e) => {
                let _ = lost.send(e);
                return;
            }
        }
    }
}

fn report_progress(metrics: &ListenerMetrics, since: Instant) {
    let events = metrics.take_window_events();
    let secs = since.elapsed().as_secs().max(1);
    info!(
        "Blk {} - {} txs {}/s",
        metrics.last_height(),
        events,
        events / secs
    );
    debug!("{}", metrics.snapshot());
}
