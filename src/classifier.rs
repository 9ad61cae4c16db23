// Liquidity classifier - values a pair's reserves in USD and sorts it into an
// alert tier. Only pairs with at least one known base token can be valued; a
// one-sided valuation doubles the known side on the assumption of balanced
// pools.

use crate::price_oracle::PriceLookup;
use crate::token_registry::TokenRegistry;
use crate::volume_analyzer::{VolumeProbe, VolumeSample};
use anyhow::Result;
use async_trait::async_trait;
use ethers::types::Address;
use log::debug;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;

/// On-chain state of a pair at classification time.
#[derive(Debug, Clone)]
pub struct PairState {
    pub token0: Address,
    pub token1: Address,
    pub reserve0: u128,
    pub reserve1: u128,
}

/// Seam over the chain read; lets tests classify synthetic reserves.
#[async_trait]
pub trait PairStateReader: Send + Sync {
    async fn pair_state(&self, pair: Address) -> Result<PairState>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LiquidityTier {
    BelowThreshold,
    EarlySignal,
    HighLiquidity,
    Mega,
}

impl LiquidityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            LiquidityTier::BelowThreshold => "below-threshold",
            LiquidityTier::EarlySignal => "early-signal",
            LiquidityTier::HighLiquidity => "high-liquidity",
            LiquidityTier::Mega => "mega",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Neither side of the pair is a known base token.
    NoKnownToken,
    /// A side was known but no USD value could be derived (zero reserves).
    NoPriceData,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NoKnownToken => "no-known-token",
            SkipReason::NoPriceData => "no-price-data",
        }
    }
}

/// Activity checks backing the early-signal channel decision.
#[derive(Debug, Clone, Copy)]
pub struct TierChecks {
    pub volume_ok: bool,
    pub swaps_ok: bool,
}

#[derive(Debug, Clone)]
pub struct PairClassification {
    pub pair: Address,
    pub token0: Address,
    pub token1: Address,
    /// How many sides could be valued (1 or 2).
    pub known_side_count: u8,
    pub liquidity_usd: Decimal,
    pub tier: LiquidityTier,
    pub checks: TierChecks,
    pub alert_channel_a: bool,
    pub alert_channel_b: bool,
    pub volume: VolumeSample,
}

#[derive(Debug, Clone)]
pub enum ClassifyResult {
    Classified(PairClassification),
    Skipped { pair: Address, reason: SkipReason },
}

#[derive(Debug, Clone, Copy)]
pub struct TierThresholds {
    pub early_min: Decimal,
    pub channel_a_min: Decimal,
    pub channel_b_min: Decimal,
    pub mega_min: Decimal,
    pub early_volume_min: Decimal,
    pub early_swaps_min: u32,
}

impl TierThresholds {
    pub fn from_settings(settings: &crate::settings::TierSettings) -> Self {
        let usd = |v: f64, fallback: i64| Decimal::from_f64(v).unwrap_or(Decimal::from(fallback));
        Self {
            early_min: usd(settings.early_min_usd, 1_000),
            channel_a_min: usd(settings.channel_a_min_usd, 10_000),
            channel_b_min: usd(settings.channel_b_min_usd, 35_000),
            mega_min: usd(settings.mega_min_usd, 50_000),
            early_volume_min: usd(settings.early_volume_min_usd, 5_000),
            early_swaps_min: settings.early_swaps_min,
        }
    }
}

#[async_trait]
pub trait PairClassifier: Send + Sync {
    /// Classifies a pair. `precomputed` carries a volume sample the caller
    /// already fetched, to avoid probing twice for the same event.
    async fn classify(
        &self,
        pair: Address,
        precomputed: Option<VolumeSample>,
    ) -> Result<ClassifyResult>;
}

pub struct LiquidityClassifier {
    reader: Arc<dyn PairStateReader>,
    registry: Arc<TokenRegistry>,
    prices: Arc<dyn PriceLookup>,
    volume: Arc<dyn VolumeProbe>,
    thresholds: TierThresholds,
}

impl LiquidityClassifier {
    pub fn new(
        reader: Arc<dyn PairStateReader>,
        registry: Arc<TokenRegistry>,
        prices: Arc<dyn PriceLookup>,
        volume: Arc<dyn VolumeProbe>,
        thresholds: TierThresholds,
    ) -> Self {
        Self {
            reader,
            registry,
            prices,
            volume,
            thresholds,
        }
    }

    /// USD value of one side, or None when the token is unknown.
    async fn side_value_usd(&self, token: Address, reserve: u128) -> Option<Decimal> {
        let known = self.registry.get(&token)?;
        let price = self.prices.price_usd(token).await?;
        Some(scale_amount(reserve, known.decimals) * price)
    }
}

#[async_trait]
impl PairClassifier for LiquidityClassifier {
    async fn classify(
        &self,
        pair: Address,
        precomputed: Option<VolumeSample>,
    ) -> Result<ClassifyResult> {
        let state = self.reader.pair_state(pair).await?;

        let value0 = self.side_value_usd(state.token0, state.reserve0).await;
        let value1 = self.side_value_usd(state.token1, state.reserve1).await;

        let (liquidity_usd, known_side_count) = match (value0, value1) {
            (None, None) => {
                return Ok(ClassifyResult::Skipped {
                    pair,
                    reason: SkipReason::NoKnownToken,
                })
            }
            // One valued side: assume the pool is balanced and double it.
            (Some(v), None) | (None, Some(v)) => (v * Decimal::TWO, 1),
            (Some(a), Some(b)) => (a + b, 2),
        };

        if liquidity_usd.is_zero() {
            return Ok(ClassifyResult::Skipped {
                pair,
                reason: SkipReason::NoPriceData,
            });
        }

        let volume = match precomputed {
            Some(sample) => sample,
            None => self.volume.analyze_pair(pair).await,
        };
        let checks = TierChecks {
            volume_ok: volume.success && volume.volume_24h_usd >= self.thresholds.early_volume_min,
            swaps_ok: volume.success && volume.swap_count_15m >= self.thresholds.early_swaps_min,
        };

        // Highest tier wins; channel routing hangs off the tier.
        let t = &self.thresholds;
        let (tier, alert_channel_a, alert_channel_b) = if liquidity_usd >= t.mega_min {
            (LiquidityTier::Mega, true, true)
        } else if liquidity_usd >= t.channel_a_min {
            (
                LiquidityTier::HighLiquidity,
                true,
                liquidity_usd >= t.channel_b_min,
            )
        } else if liquidity_usd >= t.early_min {
            // Early signals only reach channel A when activity backs them up.
            (
                LiquidityTier::EarlySignal,
                checks.volume_ok && checks.swaps_ok,
                false,
            )
        } else {
            (LiquidityTier::BelowThreshold, false, false)
        };

        debug!(
            "[classifier] {:#x}: ${} across {} side(s) -> {}",
            pair,
            liquidity_usd,
            known_side_count,
            tier.as_str()
        );

        Ok(ClassifyResult::Classified(PairClassification {
            pair,
            token0: state.token0,
            token1: state.token1,
            known_side_count,
            liquidity_usd,
            tier,
            checks,
            alert_channel_a,
            alert_channel_b,
            volume,
        }))
    }
}

/// Converts a raw reserve into a token amount. `Decimal` carries a 96-bit
/// mantissa, so absurdly large reserves shed trailing precision rather than
/// overflow.
fn scale_amount(raw: u128, decimals: u32) -> Decimal {
    const MAX_MANTISSA: u128 = 79_228_162_514_264_337_593_543_950_335;
    let mut raw = raw;
    let mut decimals = decimals.min(28);
    while raw > MAX_MANTISSA && decimals > 0 {
        raw /= 10;
        decimals -= 1;
    }
    let raw = raw.min(MAX_MANTISSA);
    Decimal::from_i128_with_scale(raw as i128, decimals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{TierSettings, TokenSettings};
    use crate::volume_analyzer::VolumeSource;
    use std::collections::HashMap;

    struct FakeReader {
        state: PairState,
    }

    #[async_trait]
    impl PairStateReader for FakeReader {
        async fn pair_state(&self, _pair: Address) -> Result<PairState> {
            Ok(self.state.clone())
        }
    }

    struct FakePrices {
        prices: HashMap<Address, Decimal>,
    }

    #[async_trait]
    impl PriceLookup for FakePrices {
        async fn price_usd(&self, token: Address) -> Option<Decimal> {
            self.prices.get(&token).copied()
        }
    }

    struct FakeVolume {
        sample: VolumeSample,
    }

    #[async_trait]
    impl VolumeProbe for FakeVolume {
        async fn analyze_pair(&self, _pair: Address) -> VolumeSample {
            self.sample.clone()
        }
    }

    fn wbnb() -> Address {
        "0xbb4CdB9CBd36B01bD1cBaEBF2De08d9173bc095c".parse().unwrap()
    }

    fn busd() -> Address {
        "0xe9e7CEA3DedcA5984780Bafc599bD69ADd087D56".parse().unwrap()
    }

    fn meme() -> Address {
        "0x1234567890123456789012345678901234567890".parse().unwrap()
    }

    fn active_sample() -> VolumeSample {
        VolumeSample {
            volume_24h_usd: Decimal::from(6_000),
            swap_count_15m: 12,
            swap_count_1h: 40,
            success: true,
            source: Some(VolumeSource::Indexer),
        }
    }

    fn classifier(state: PairState, native_price: Decimal, sample: VolumeSample) -> LiquidityClassifier {
        let mut prices = HashMap::new();
        prices.insert(wbnb(), native_price);
        prices.insert(busd(), Decimal::ONE);
        LiquidityClassifier::new(
            Arc::new(FakeReader { state }),
            Arc::new(TokenRegistry::from_settings(&TokenSettings::default()).unwrap()),
            Arc::new(FakePrices { prices }),
            Arc::new(FakeVolume { sample }),
            TierThresholds::from_settings(&TierSettings::default()),
        )
    }

    fn classified(result: ClassifyResult) -> PairClassification {
        match result {
            ClassifyResult::Classified(c) => c,
            ClassifyResult::Skipped { reason, .. } => {
                panic!("expected classification, got skip {:?}", reason)
            }
        }
    }

    #[tokio::test]
    async fn one_sided_valuation_doubles_the_known_side() {
        // 10 WBNB at $600 on one side, unknown token on the other.
        let state = PairState {
            token0: wbnb(),
            token1: meme(),
            reserve0: 10_000_000_000_000_000_000,
            reserve1: 1_000_000,
        };
        let c = classifier(state, Decimal::from(600), active_sample());
        let result = classified(c.classify(Address::zero(), None).await.unwrap());

        assert_eq!(result.known_side_count, 1);
        assert_eq!(result.liquidity_usd, Decimal::from(12_000));
        assert_eq!(result.tier, LiquidityTier::HighLiquidity);
    }

    #[tokio::test]
    async fn two_sided_valuation_sums_both_sides() {
        // 10 WBNB at $600 plus 30,000 BUSD.
        let state = PairState {
            token0: wbnb(),
            token1: busd(),
            reserve0: 10_000_000_000_000_000_000,
            reserve1: 30_000_000_000_000_000_000_000,
        };
        let c = classifier(state, Decimal::from(600), active_sample());
        let result = classified(c.classify(Address::zero(), None).await.unwrap());

        assert_eq!(result.known_side_count, 2);
        assert_eq!(result.liquidity_usd, Decimal::from(36_000));
        assert_eq!(result.tier, LiquidityTier::HighLiquidity);
        assert!(result.alert_channel_a);
        assert!(result.alert_channel_b);
    }

    #[tokio::test]
    async fn mega_tier_takes_precedence_and_routes_both_channels() {
        // 50 WBNB doubled = $60,000.
        let state = PairState {
            token0: meme(),
            token1: wbnb(),
            reserve0: 1,
            reserve1: 50_000_000_000_000_000_000,
        };
        let c = classifier(state, Decimal::from(600), active_sample());
        let result = classified(c.classify(Address::zero(), None).await.unwrap());

        assert_eq!(result.tier, LiquidityTier::Mega);
        assert!(result.alert_channel_a);
        assert!(result.alert_channel_b);
    }

    #[tokio::test]
    async fn early_signal_needs_both_volume_and_swaps_for_channel_a() {
        // 2 WBNB doubled = $2,400 -> early-signal band.
        let state = PairState {
            token0: wbnb(),
            token1: meme(),
            reserve0: 2_000_000_000_000_000_000,
            reserve1: 1,
        };

        // Volume above the bar but too few swaps: no alert.
        let mut sample = active_sample();
        sample.swap_count_15m = 3;
        let c = classifier(state.clone(), Decimal::from(600), sample);
        let result = classified(c.classify(Address::zero(), None).await.unwrap());
        assert_eq!(result.tier, LiquidityTier::EarlySignal);
        assert!(result.checks.volume_ok);
        assert!(!result.checks.swaps_ok);
        assert!(!result.alert_channel_a);
        assert!(!result.alert_channel_b);

        // Both checks green: channel A fires, channel B stays quiet.
        let c = classifier(state, Decimal::from(600), active_sample());
        let result = classified(c.classify(Address::zero(), None).await.unwrap());
        assert!(result.alert_channel_a);
        assert!(!result.alert_channel_b);
    }

    #[tokio::test]
    async fn unknown_volume_never_fires_early_channel_a() {
        let state = PairState {
            token0: wbnb(),
            token1: meme(),
            reserve0: 2_000_000_000_000_000_000,
            reserve1: 1,
        };
        let c = classifier(state, Decimal::from(600), VolumeSample::unavailable());
        let result = classified(c.classify(Address::zero(), None).await.unwrap());

        assert_eq!(result.tier, LiquidityTier::EarlySignal);
        assert!(!result.checks.volume_ok);
        assert!(!result.alert_channel_a);
    }

    #[tokio::test]
    async fn pair_without_known_tokens_is_skipped() {
        let other: Address = "0x2222222222222222222222222222222222222222".parse().unwrap();
        let state = PairState {
            token0: meme(),
            token1: other,
            reserve0: 1_000,
            reserve1: 1_000,
        };
        let c = classifier(state, Decimal::from(600), active_sample());

        match c.classify(Address::zero(), None).await.unwrap() {
            ClassifyResult::Skipped { reason, .. } => {
                assert_eq!(reason, SkipReason::NoKnownToken)
            }
            ClassifyResult::Classified(_) => panic!("should skip unvalued pair"),
        }
    }

    #[tokio::test]
    async fn empty_reserves_skip_as_no_price_data() {
        let state = PairState {
            token0: wbnb(),
            token1: meme(),
            reserve0: 0,
            reserve1: 0,
        };
        let c = classifier(state, Decimal::from(600), active_sample());

        match c.classify(Address::zero(), None).await.unwrap() {
            ClassifyResult::Skipped { reason, .. } => {
                assert_eq!(reason, SkipReason::NoPriceData)
            }
            ClassifyResult::Classified(_) => panic!("should skip empty pair"),
        }
    }

    #[test]
    fn scale_amount_handles_oversized_reserves() {
        // 2^112 - 1 raw with 18 decimals must not panic.
        let huge = (1u128 << 112) - 1;
        let amount = scale_amount(huge, 18);
        assert!(amount > Decimal::ZERO);
        assert_eq!(scale_amount(1_500_000, 6), Decimal::new(1_500_000, 6));
    }
}
