//! # Pairwatch Service
//!
//! Long-running service that watches the factory for new trading pairs,
//! classifies their liquidity and emits tiered alerts.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin pairwatch
//! ```
//!
//! Configuration comes from `Config.toml` plus `PAIRWATCH_*` environment
//! variables. Press Ctrl+C to stop gracefully; final counters are logged on
//! the way out.

use anyhow::{Context, Result};
use pairwatch::{
    chain_reader::RpcPairReader,
    classifier::{LiquidityClassifier, TierThresholds},
    detector::PairEventDetector,
    explorer::ExplorerClient,
    notifier::LogNotifier,
    price_cache::PriceCache,
    price_oracle::PriceOracle,
    rpc_pool::RpcEndpointPool,
    safety::SafetyChecker,
    settings::Settings,
    token_registry::TokenRegistry,
    volume_analyzer::VolumeAnalyzer,
};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("[main] Starting pairwatch");
    let settings = Settings::new().context("failed to load configuration")?;

    // RPC pool: startup fails only when no endpoint at all is reachable.
    let pool = Arc::new(RpcEndpointPool::new(&settings)?);
    pool.connect().await?;
    let _health = pool.spawn_health_checker();

    let registry = Arc::new(TokenRegistry::from_settings(&settings.tokens)?);
    info!("[main] {} known base tokens loaded", registry.len());

    let cache = Arc::new(
        PriceCache::connect(
            settings.cache.redis_url.as_deref(),
            Duration::from_secs(settings.cache.price_ttl_seconds),
        )
        .await,
    );
    let oracle = Arc::new(PriceOracle::with_default_sources(
        registry.clone(),
        cache,
        &settings.pricing,
    )?);

    let volume = Arc::new(VolumeAnalyzer::from_settings(&settings.volume)?);
    let reader = Arc::new(RpcPairReader::new(pool.clone()));
    let classifier = Arc::new(LiquidityClassifier::new(
        reader,
        registry.clone(),
        oracle,
        volume,
        TierThresholds::from_settings(&settings.tiers),
    ));

    let explorer = match ExplorerClient::from_settings(&settings.explorer)? {
        Some(client) => Some(Arc::new(client)),
        None => {
            warn!("[main] No explorer configured; verification checks disabled");
            None
        }
    };
    let safety = Some(Arc::new(SafetyChecker::new(pool.clone(), explorer)));

    let detector = Arc::new(PairEventDetector::new(
        &settings.detector,
        settings.rpc.ws_url.clone(),
        pool.clone(),
        classifier,
        Arc::new(LogNotifier),
        safety,
        registry,
    )?);

    let runner = {
        let detector = Arc::clone(&detector);
        tokio::spawn(async move { detector.run().await })
    };

    signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("[main] Shutdown signal received");

    detector.stop().await;
    match runner.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("[main] Detector exited with error: {}", e),
        Err(e) => warn!("[main] Detector task join failed: {}", e),
    }

    let stats = detector.stats();
    info!(
        "[main] Final: {} events, {} pairs processed, {} duplicates, {} classify errors, {} backfilled (mode: {})",
        stats.events_seen,
        stats.pairs_processed,
        stats.duplicates_skipped,
        stats.classification_errors,
        stats.backfilled_pairs,
        stats.mode
    );
    let pool_stats = pool.stats();
    info!(
        "[main] RPC pool: {} requests, {} failures, {} failovers",
        pool_stats.total_requests, pool_stats.total_failures, pool_stats.failover_events
    );

    Ok(())
}
