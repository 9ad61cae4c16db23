// Pair-creation detector - watches the factory for PairCreated events.
//
// Runs in push mode (websocket event stream) when a ws endpoint is
// configured and reachable, and degrades one-way to HTTP log polling when
// the stream drops. A periodic backfill sweep compares the factory's pair
// count against its own cursor so pairs missed during any outage are still
// picked up. Deduplication is in-memory for the process lifetime.

use crate::classifier::{ClassifyResult, PairClassifier};
use crate::contracts::{IUniswapV2Factory, PairCreatedFilter, PAIR_CREATED_SIGNATURE};
use crate::notifier::PairNotifier;
use crate::rpc_pool::RpcEndpointPool;
use crate::safety::SafetyChecker;
use crate::settings::DetectorSettings;
use crate::token_registry::TokenRegistry;
use anyhow::{anyhow, Context, Result};
use dashmap::DashSet;
use ethers::contract::parse_log;
use ethers::middleware::Middleware;
use ethers::providers::{Provider, Ws};
use futures_util::StreamExt;
use ethers::types::{Address, Filter, H256, U64};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

/// Where a pair address came from, for logging and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairOrigin {
    Push,
    Poll,
    Backfill,
}

impl PairOrigin {
    fn as_str(&self) -> &'static str {
        match self {
            PairOrigin::Push => "push",
            PairOrigin::Poll => "poll",
            PairOrigin::Backfill => "backfill",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectorStats {
    pub events_seen: u64,
    pub pairs_processed: u64,
    pub duplicates_skipped: u64,
    pub classification_errors: u64,
    pub backfilled_pairs: u64,
    pub mode: &'static str,
}

pub struct PairEventDetector {
    pool: Arc<RpcEndpointPool>,
    classifier: Arc<dyn PairClassifier>,
    notifier: Arc<dyn PairNotifier>,
    safety: Option<Arc<SafetyChecker>>,
    registry: Arc<TokenRegistry>,

    factory: Address,
    ws_url: Option<String>,
    poll_interval: Duration,
    backfill_interval: Duration,
    max_backfill_pairs: u64,

    seen: DashSet<Address>,
    /// Highest block fully processed by the poll path; 0 means unset.
    last_processed_block: AtomicU64,
    /// Factory pair index the backfill sweep has covered up to (exclusive).
    backfill_cursor: AtomicU64,
    running: AtomicBool,
    push_active: AtomicBool,
    /// Broadcast to every loop so `stop()` interrupts in-flight waits
    /// (stream reads and interval sleeps), not just the next flag check.
    shutdown: watch::Sender<bool>,

    events_seen: AtomicU64,
    pairs_processed: AtomicU64,
    duplicates_skipped: AtomicU64,
    classification_errors: AtomicU64,
    backfilled_pairs: AtomicU64,
}

impl PairEventDetector {
    pub fn new(
        settings: &DetectorSettings,
        ws_url: Option<String>,
        pool: Arc<RpcEndpointPool>,
        classifier: Arc<dyn PairClassifier>,
        notifier: Arc<dyn PairNotifier>,
        safety: Option<Arc<SafetyChecker>>,
        registry: Arc<TokenRegistry>,
    ) -> Result<Self> {
        let factory: Address = settings
            .factory_address
            .parse()
            .with_context(|| format!("invalid factory address {}", settings.factory_address))?;

        Ok(Self {
            pool,
            classifier,
            notifier,
            safety,
            registry,
            factory,
            ws_url,
            poll_interval: Duration::from_secs(settings.poll_interval_seconds),
            backfill_interval: Duration::from_secs(settings.backfill_interval_seconds),
            max_backfill_pairs: settings.max_backfill_pairs,
            seen: DashSet::new(),
            last_processed_block: AtomicU64::new(0),
            backfill_cursor: AtomicU64::new(0),
            running: AtomicBool::new(false),
            push_active: AtomicBool::new(false),
            shutdown: watch::channel(false).0,
            events_seen: AtomicU64::new(0),
            pairs_processed: AtomicU64::new(0),
            duplicates_skipped: AtomicU64::new(0),
            classification_errors: AtomicU64::new(0),
            backfilled_pairs: AtomicU64::new(0),
        })
    }

    /// Runs until `stop()`. Push mode is attempted first when a ws endpoint is
    /// configured; once it drops, the detector stays in poll mode for good.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        self.initialize_cursors().await?;

        let backfill = {
            let detector = Arc::clone(&self);
            tokio::spawn(async move { detector.backfill_loop().await })
        };

        if let Some(ws_url) = self.ws_url.clone() {
            match self.run_push(&ws_url).await {
                Ok(()) => {}
                Err(e) => {
                    warn!(
                        "[detector] Push mode unavailable ({}); degrading to polling",
                        e
                    );
                }
            }
        }

        if self.running.load(Ordering::SeqCst) {
            self.poll_loop().await;
        }

        backfill.abort();
        Ok(())
    }

    /// Halts all loops, cancelling the push subscription and any pending
    /// interval sleep, then flushes the notifier.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
        self.notifier.flush().await;
        info!("[detector] Stopped");
    }

    pub fn stats(&self) -> DetectorStats {
        DetectorStats {
            events_seen: self.events_seen.load(Ordering::SeqCst),
            pairs_processed: self.pairs_processed.load(Ordering::SeqCst),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::SeqCst),
            classification_errors: self.classification_errors.load(Ordering::SeqCst),
            backfilled_pairs: self.backfilled_pairs.load(Ordering::SeqCst),
            mode: if self.push_active.load(Ordering::SeqCst) {
                "push"
            } else {
                "poll"
            },
        }
    }

    /// Watermarks start at the current chain head and factory length, so only
    /// pairs created after startup are reported.
    async fn initialize_cursors(&self) -> Result<()> {
        let latest = self
            .pool
            .execute_with_failover("latest_block", |provider, _url| async move {
                Ok(provider.get_block_number().await?)
            })
            .await?;
        self.last_processed_block
            .store(latest.as_u64(), Ordering::SeqCst);

        let factory = self.factory;
        let length = self
            .pool
            .execute_with_failover("all_pairs_length", move |provider, _url| async move {
                let contract = IUniswapV2Factory::new(factory, provider);
                Ok(contract.all_pairs_length().call().await?)
            })
            .await?;
        self.backfill_cursor
            .store(length.as_u64(), Ordering::SeqCst);

        info!(
            "[detector] Watching factory {:#x} from block {} (pair #{})",
            self.factory, latest, length
        );
        Ok(())
    }

    // ---- push mode ----

    async fn run_push(&self, ws_url: &str) -> Result<()> {
        let provider = Provider::<Ws>::connect(ws_url)
            .await
            .context("ws connect failed")?;
        let provider = Arc::new(provider);
        let factory = IUniswapV2Factory::new(self.factory, provider);

        let events = factory.event::<PairCreatedFilter>();
        let mut stream = events
            .subscribe_with_meta()
            .await
            .context("event subscription failed")?;

        self.push_active.store(true, Ordering::SeqCst);
        info!("[detector] Push mode active on {}", ws_url);

        let mut shutdown = self.shutdown.subscribe();
        let result = loop {
            if !self.running.load(Ordering::SeqCst) {
                break Ok(());
            }
            tokio::select! {
                // stop() cancels the subscription even on a quiescent stream.
                _ = shutdown.changed() => break Ok(()),
                item = stream.next() => match item {
                    Some(Ok((event, meta))) => {
                        self.events_seen.fetch_add(1, Ordering::SeqCst);
                        // Keep the poll watermark moving so a later fallback
                        // does not replay blocks the stream already covered.
                        self.last_processed_block
                            .fetch_max(meta.block_number.as_u64(), Ordering::SeqCst);
                        self.process_pair(event.pair, PairOrigin::Push).await;
                    }
                    Some(Err(e)) => break Err(anyhow!("event stream error: {}", e)),
                    None => break Err(anyhow!("event stream closed")),
                }
            }
        };

        self.push_active.store(false, Ordering::SeqCst);
        result
    }

    // ---- poll mode ----

    async fn poll_loop(&self) {
        info!(
            "[detector] Poll mode active (every {:?})",
            self.poll_interval
        );
        let mut shutdown = self.shutdown.subscribe();
        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = sleep(self.poll_interval) => {}
            }
            if let Err(e) = self.poll_once().await {
                // Watermark untouched; the failed range is retried next tick.
                warn!("[detector] Poll tick failed: {}", e);
            }
        }
    }

    async fn poll_once(&self) -> Result<()> {
        let latest = self
            .pool
            .execute_with_failover("latest_block", |provider, _url| async move {
                Ok(provider.get_block_number().await?)
            })
            .await?
            .as_u64();

        let from = self.last_processed_block.load(Ordering::SeqCst) + 1;
        if from > latest {
            return Ok(());
        }

        let topic0: H256 = PAIR_CREATED_SIGNATURE
            .parse()
            .context("bad event signature constant")?;
        let factory = self.factory;
        let filter = Filter::new()
            .address(factory)
            .topic0(topic0)
            .from_block(U64::from(from))
            .to_block(U64::from(latest));

        let logs = self
            .pool
            .execute_with_failover("pair_created_logs", move |provider, _url| {
                let filter = filter.clone();
                async move { Ok(provider.get_logs(&filter).await?) }
            })
            .await?;

        debug!(
            "[detector] Polled blocks {}..={}: {} log(s)",
            from,
            latest,
            logs.len()
        );

        for log in logs {
            match parse_log::<PairCreatedFilter>(log) {
                Ok(event) => {
                    self.events_seen.fetch_add(1, Ordering::SeqCst);
                    self.process_pair(event.pair, PairOrigin::Poll).await;
                }
                Err(e) => warn!("[detector] Undecodable PairCreated log: {}", e),
            }
        }

        // Only a fully successful fetch advances the watermark.
        self.last_processed_block.store(latest, Ordering::SeqCst);
        Ok(())
    }

    // ---- backfill sweep ----

    async fn backfill_loop(&self) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = sleep(self.backfill_interval) => {}
            }
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = self.backfill_once().await {
                warn!("[detector] Backfill sweep failed: {}", e);
            }
        }
    }

    async fn backfill_once(&self) -> Result<()> {
        let factory = self.factory;
        let length = self
            .pool
            .execute_with_failover("all_pairs_length", move |provider, _url| async move {
                let contract = IUniswapV2Factory::new(factory, provider);
                Ok(contract.all_pairs_length().call().await?)
            })
            .await?
            .as_u64();

        let cursor = self.backfill_cursor.load(Ordering::SeqCst);
        if length <= cursor {
            return Ok(());
        }

        // Bounded sweep; anything beyond the cap waits for the next tick.
        let upto = length.min(cursor + self.max_backfill_pairs);
        info!(
            "[detector] Backfilling pair indices {}..{} (factory has {})",
            cursor, upto, length
        );

        for index in cursor..upto {
            let pair = match self.pair_at(index).await {
                Ok(pair) => pair,
                Err(e) => {
                    // Advance only past what was actually fetched; the rest is
                    // retried on the next sweep.
                    warn!("[detector] allPairs({}) failed: {}", index, e);
                    self.backfill_cursor.store(index, Ordering::SeqCst);
                    return Ok(());
                }
            };
            self.process_pair(pair, PairOrigin::Backfill).await;
        }

        self.backfill_cursor.store(upto, Ordering::SeqCst);
        Ok(())
    }

    async fn pair_at(&self, index: u64) -> Result<Address> {
        let factory = self.factory;
        self.pool
            .execute_with_failover("all_pairs", move |provider, _url| async move {
                let contract = IUniswapV2Factory::new(factory, provider);
                Ok(contract.all_pairs(index.into()).call().await?)
            })
            .await
    }

    // ---- per-pair pipeline ----

    /// Feeds a pair address into the pipeline directly, as if the poll path
    /// had delivered it. Useful for embedding and replay tooling.
    pub async fn ingest_pair(&self, pair: Address) {
        self.process_pair(pair, PairOrigin::Poll).await;
    }

    /// Dedup, classify, safety-check, notify. Errors are contained here; a
    /// bad pair never takes down a detection loop.
    async fn process_pair(&self, pair: Address, origin: PairOrigin) {
        // DashSet::insert is the atomic test-and-set; false means already seen.
        if !self.seen.insert(pair) {
            self.duplicates_skipped.fetch_add(1, Ordering::SeqCst);
            debug!("[detector] Duplicate pair {:#x} via {}", pair, origin.as_str());
            return;
        }
        self.pairs_processed.fetch_add(1, Ordering::SeqCst);
        // Counted after dedup, so a pair already seen via push or poll is not
        // billed to the backfill sweep.
        if origin == PairOrigin::Backfill {
            self.backfilled_pairs.fetch_add(1, Ordering::SeqCst);
        }
        info!("[detector] New pair {:#x} via {}", pair, origin.as_str());

        match self.classifier.classify(pair, None).await {
            Ok(ClassifyResult::Classified(classification)) => {
                if classification.alert_channel_a || classification.alert_channel_b {
                    self.report_safety(&classification).await;
                }
                self.notifier.pair_classified(&classification).await;
            }
            Ok(ClassifyResult::Skipped { pair, reason }) => {
                self.notifier.pair_skipped(pair, reason).await;
            }
            Err(e) => {
                self.classification_errors.fetch_add(1, Ordering::SeqCst);
                error!("[detector] Classification failed for {:#x}: {}", pair, e);
                self.notifier.pair_error(pair, &e).await;
            }
        }
    }

    /// Best-effort safety probe on the non-base side of an alerting pair.
    async fn report_safety(&self, classification: &crate::classifier::PairClassification) {
        let checker = match &self.safety {
            Some(c) => c,
            None => return,
        };
        let target = [classification.token0, classification.token1]
            .into_iter()
            .find(|t| !self.registry.is_known(t));
        if let Some(token) = target {
            let report = checker.check(token).await;
            info!(
                "[detector] Safety {:#x}: verified={:?} owner_renounced={:?}",
                token, report.verified, report.owner_renounced
            );
        }
    }
}
