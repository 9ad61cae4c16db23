// Notifier boundary - the detector emits classified pairs here. The default
// implementation writes structured log lines per channel; deployments wire in
// their own sink behind the same trait.

use crate::classifier::{PairClassification, SkipReason};
use async_trait::async_trait;
use ethers::types::Address;
use log::{debug, info, warn};

#[async_trait]
pub trait PairNotifier: Send + Sync {
    async fn pair_classified(&self, classification: &PairClassification);

    async fn pair_skipped(&self, pair: Address, reason: SkipReason);

    /// Best-effort downstream signal that a pair could not be processed.
    async fn pair_error(&self, _pair: Address, _error: &anyhow::Error) {}

    /// Called once during shutdown so buffering implementations can drain.
    async fn flush(&self) {}
}

/// Log-backed notifier; channel A/B routing shows up as separate lines so
/// downstream log shippers can split on them.
pub struct LogNotifier;

#[async_trait]
impl PairNotifier for LogNotifier {
    async fn pair_classified(&self, c: &PairClassification) {
        info!(
            "[notifier] Pair {:#x} ({:#x}/{:#x}) liquidity ${} tier={} sides={}",
            c.pair,
            c.token0,
            c.token1,
            c.liquidity_usd.round_dp(2),
            c.tier.as_str(),
            c.known_side_count
        );
        if c.alert_channel_a {
            info!(
                "[notifier] ALERT channel-a pair={:#x} tier={} volume24h=${} swaps15m={}",
                c.pair,
                c.tier.as_str(),
                c.volume.volume_24h_usd.round_dp(2),
                c.volume.swap_count_15m
            );
        }
        if c.alert_channel_b {
            info!(
                "[notifier] ALERT channel-b pair={:#x} tier={} liquidity=${}",
                c.pair,
                c.tier.as_str(),
                c.liquidity_usd.round_dp(2)
            );
        }
    }

    async fn pair_skipped(&self, pair: Address, reason: SkipReason) {
        debug!("[notifier] Pair {:#x} skipped: {}", pair, reason.as_str());
    }

    async fn pair_error(&self, pair: Address, error: &anyhow::Error) {
        warn!("[notifier] Pair {:#x} processing failed: {}", pair, error);
    }
}
