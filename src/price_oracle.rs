// Price/Liquidity Oracle - resolves a known base token's USD price through a
// cascading provider list (CoinGecko -> DexScreener -> exchange ticker), with
// a TTL cache in front and stale-read / sentinel fallbacks behind.

use crate::cascade::{first_success, CascadeSource, GatePolicy, RateGate};
use crate::price_cache::{CachedPrice, PriceCache};
use crate::settings::PricingSettings;
use crate::token_registry::{PriceRef, Pricing, TokenRegistry};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::Address;
use log::{debug, warn};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Seam the classifier depends on; lets tests price pairs without upstreams.
#[async_trait]
pub trait PriceLookup: Send + Sync {
    /// USD price for a known base token; `None` means "not a known token" and
    /// the caller cannot value that side of a pair.
    async fn price_usd(&self, token: Address) -> Option<Decimal>;
}

pub struct PriceOracle {
    registry: Arc<TokenRegistry>,
    cache: Arc<PriceCache>,
    sources: Vec<Arc<dyn CascadeSource<PriceRef, Decimal>>>,
    /// Last successfully fetched price per symbol, regardless of age. Only
    /// consulted when the whole cascade fails (stale-read fallback).
    last_known: DashMap<String, Decimal>,
    default_price: Decimal,
}

impl PriceOracle {
    pub fn new(
        registry: Arc<TokenRegistry>,
        cache: Arc<PriceCache>,
        sources: Vec<Arc<dyn CascadeSource<PriceRef, Decimal>>>,
        default_price: Decimal,
    ) -> Self {
        Self {
            registry,
            cache,
            sources,
            last_known: DashMap::new(),
            default_price,
        }
    }

    /// Standard three-provider cascade built from settings.
    pub fn with_default_sources(
        registry: Arc<TokenRegistry>,
        cache: Arc<PriceCache>,
        pricing: &PricingSettings,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(pricing.http_timeout_ms))
            .build()
            .context("failed to build pricing http client")?;

        let sources: Vec<Arc<dyn CascadeSource<PriceRef, Decimal>>> = vec![
            Arc::new(CoinGeckoSource::new(
                client.clone(),
                pricing.coingecko_url.clone(),
                Duration::from_millis(pricing.coingecko_interval_ms),
            )),
            Arc::new(DexScreenerTokenSource::new(
                client.clone(),
                pricing.dexscreener_url.clone(),
                Duration::from_millis(pricing.dexscreener_interval_ms),
            )),
            Arc::new(BinanceTickerSource::new(
                client,
                pricing.binance_url.clone(),
                Duration::from_millis(pricing.binance_interval_ms),
            )),
        ];

        let default_price = Decimal::from_f64(pricing.default_native_price_usd)
            .ok_or_else(|| anyhow!("invalid default_native_price_usd"))?;

        Ok(Self::new(registry, cache, sources, default_price))
    }

    async fn resolve_dynamic(&self, price_ref: &PriceRef) -> Decimal {
        if let Some(hit) = self.cache.get(&price_ref.symbol).await {
            return hit.price_usd;
        }

        match first_success(&self.sources, price_ref, GatePolicy::SkipWhenLimited).await {
            Ok((price, source)) => {
                debug!(
                    "[price_oracle] {} = ${} via {}",
                    price_ref.symbol, price, source
                );
                self.cache
                    .put(CachedPrice::now(&price_ref.symbol, price))
                    .await;
                self.last_known.insert(price_ref.symbol.clone(), price);
                price
            }
            Err(e) => {
                if let Some(stale) = self.last_known.get(&price_ref.symbol) {
                    warn!(
                        "[price_oracle] All providers failed for {} ({}); serving stale price ${}",
                        price_ref.symbol, e, *stale
                    );
                    *stale
                } else {
                    warn!(
                        "[price_oracle] All providers failed for {} ({}) and no prior value; using default ${}",
                        price_ref.symbol, e, self.default_price
                    );
                    self.default_price
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn seed_last_known(&self, symbol: &str, price: Decimal) {
        self.last_known.insert(symbol.to_string(), price);
    }
}

#[async_trait]
impl PriceLookup for PriceOracle {
    async fn price_usd(&self, token: Address) -> Option<Decimal> {
        let known = self.registry.get(&token)?;
        match &known.pricing {
            // Pegged assets never touch the network or the cache.
            Pricing::Fixed(price) => Some(*price),
            Pricing::Dynamic(price_ref) => Some(self.resolve_dynamic(price_ref).await),
        }
    }
}

// ---- upstream sources ----

type CoinGeckoResponse = HashMap<String, CoinGeckoTokenPrice>;

#[derive(Debug, Deserialize)]
struct CoinGeckoTokenPrice {
    usd: f64,
}

/// Primary pricing API: CoinGecko simple-price lookup by asset id.
pub struct CoinGeckoSource {
    client: reqwest::Client,
    base_url: String,
    gate: RateGate,
}

impl CoinGeckoSource {
    pub fn new(client: reqwest::Client, base_url: String, interval: Duration) -> Self {
        Self {
            client,
            base_url,
            gate: RateGate::new(interval),
        }
    }
}

#[async_trait]
impl CascadeSource<PriceRef, Decimal> for CoinGeckoSource {
    fn name(&self) -> &'static str {
        "coingecko"
    }

    fn gate(&self) -> &RateGate {
        &self.gate
    }

    async fn fetch(&self, price_ref: &PriceRef) -> Result<Decimal> {
        let url = format!(
            "{}/simple/price?ids={}&vs_currencies=usd",
            self.base_url, price_ref.coingecko_id
        );
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("http {}", response.status());
        }
        let data: CoinGeckoResponse = response.json().await?;
        let price = data
            .get(&price_ref.coingecko_id)
            .map(|p| p.usd)
            .ok_or_else(|| anyhow!("id {} missing from response", price_ref.coingecko_id))?;
        decimal_price(price)
    }
}

#[derive(Debug, Deserialize)]
struct DexScreenerTokenResponse {
    pairs: Option<Vec<DexScreenerPairEntry>>,
}

#[derive(Debug, Deserialize)]
struct DexScreenerPairEntry {
    #[serde(rename = "priceUsd")]
    price_usd: Option<String>,
    liquidity: Option<DexScreenerLiquidity>,
}

#[derive(Debug, Deserialize)]
struct DexScreenerLiquidity {
    usd: Option<f64>,
}

/// Secondary: DexScreener token lookup by contract address. When several
/// pairs come back, the most liquid one wins.
pub struct DexScreenerTokenSource {
    client: reqwest::Client,
    base_url: String,
    gate: RateGate,
}

impl DexScreenerTokenSource {
    pub fn new(client: reqwest::Client, base_url: String, interval: Duration) -> Self {
        Self {
            client,
            base_url,
            gate: RateGate::new(interval),
        }
    }
}

#[async_trait]
impl CascadeSource<PriceRef, Decimal> for DexScreenerTokenSource {
    fn name(&self) -> &'static str {
        "dexscreener"
    }

    fn gate(&self) -> &RateGate {
        &self.gate
    }

    async fn fetch(&self, price_ref: &PriceRef) -> Result<Decimal> {
        let url = format!(
            "{}/latest/dex/tokens/{:#x}",
            self.base_url, price_ref.address
        );
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("http {}", response.status());
        }
        let data: DexScreenerTokenResponse = response.json().await?;
        let mut pairs = data.pairs.unwrap_or_default();
        pairs.sort_by(|a, b| {
            let la = a.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0);
            let lb = b.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0);
            lb.partial_cmp(&la).unwrap_or(std::cmp::Ordering::Equal)
        });

        let price_str = pairs
            .iter()
            .find_map(|p| p.price_usd.as_deref())
            .ok_or_else(|| anyhow!("no priced pairs for {}", price_ref.symbol))?;
        let price: Decimal = price_str
            .parse()
            .with_context(|| format!("unparseable priceUsd {:?}", price_str))?;
        if price <= Decimal::ZERO {
            anyhow::bail!("non-positive price {}", price);
        }
        Ok(price)
    }
}

#[derive(Debug, Deserialize)]
struct BinanceTicker {
    price: String,
}

/// Tertiary: exchange ticker-by-symbol lookup.
pub struct BinanceTickerSource {
    client: reqwest::Client,
    base_url: String,
    gate: RateGate,
}

impl BinanceTickerSource {
    pub fn new(client: reqwest::Client, base_url: String, interval: Duration) -> Self {
        Self {
            client,
            base_url,
            gate: RateGate::new(interval),
        }
    }
}

#[async_trait]
impl CascadeSource<PriceRef, Decimal> for BinanceTickerSource {
    fn name(&self) -> &'static str {
        "binance"
    }

    fn gate(&self) -> &RateGate {
        &self.gate
    }

    async fn fetch(&self, price_ref: &PriceRef) -> Result<Decimal> {
        let url = format!(
            "{}/api/v3/ticker/price?symbol={}",
            self.base_url, price_ref.ticker
        );
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("http {}", response.status());
        }
        let ticker: BinanceTicker = response.json().await?;
        let price: Decimal = ticker
            .price
            .parse()
            .with_context(|| format!("unparseable ticker price {:?}", ticker.price))?;
        if price <= Decimal::ZERO {
            anyhow::bail!("non-positive price {}", price);
        }
        Ok(price)
    }
}

fn decimal_price(value: f64) -> Result<Decimal> {
    if !value.is_finite() || value <= 0.0 {
        anyhow::bail!("unusable price value {}", value);
    }
    Decimal::from_f64(value).ok_or_else(|| anyhow!("price {} not representable", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::TokenSettings;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeSource {
        name: &'static str,
        gate: RateGate,
        fail: AtomicBool,
        calls: AtomicUsize,
        price: Decimal,
    }

    impl FakeSource {
        fn new(name: &'static str, price: Decimal, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                gate: RateGate::new(Duration::from_millis(0)),
                fail: AtomicBool::new(fail),
                calls: AtomicUsize::new(0),
                price,
            })
        }
    }

    #[async_trait]
    impl CascadeSource<PriceRef, Decimal> for FakeSource {
        fn name(&self) -> &'static str {
            self.name
        }
        fn gate(&self) -> &RateGate {
            &self.gate
        }
        async fn fetch(&self, _input: &PriceRef) -> Result<Decimal> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("{} down", self.name)
            }
            Ok(self.price)
        }
    }

    fn registry() -> Arc<TokenRegistry> {
        Arc::new(TokenRegistry::from_settings(&TokenSettings::default()).unwrap())
    }

    fn wbnb() -> Address {
        "0xbb4CdB9CBd36B01bD1cBaEBF2De08d9173bc095c".parse().unwrap()
    }

    fn busd() -> Address {
        "0xe9e7CEA3DedcA5984780Bafc599bD69ADd087D56".parse().unwrap()
    }

    fn oracle_with(sources: Vec<Arc<dyn CascadeSource<PriceRef, Decimal>>>) -> PriceOracle {
        PriceOracle::new(
            registry(),
            Arc::new(PriceCache::in_process(Duration::from_secs(60))),
            sources,
            Decimal::from(600),
        )
    }

    #[tokio::test]
    async fn fixed_price_token_never_calls_providers() {
        let source = FakeSource::new("a", Decimal::from(999), false);
        let oracle = oracle_with(vec![source.clone()]);

        let price = oracle.price_usd(busd()).await.unwrap();

        assert_eq!(price, Decimal::ONE);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_token_is_not_found() {
        let oracle = oracle_with(vec![]);
        let unknown: Address = "0x1111111111111111111111111111111111111111".parse().unwrap();
        assert!(oracle.price_usd(unknown).await.is_none());
    }

    #[tokio::test]
    async fn cascade_falls_through_to_third_provider_and_caches() {
        let a = FakeSource::new("a", Decimal::ZERO, true);
        let b = FakeSource::new("b", Decimal::ZERO, true);
        let c = FakeSource::new("c", Decimal::from(610), false);
        let oracle = oracle_with(vec![a.clone(), b.clone(), c.clone()]);

        let price = oracle.price_usd(wbnb()).await.unwrap();
        assert_eq!(price, Decimal::from(610));

        // Second lookup is served from cache; no further provider calls.
        let price = oracle.price_usd(wbnb()).await.unwrap();
        assert_eq!(price, Decimal::from(610));
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(c.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_value_beats_sentinel_default() {
        let a = FakeSource::new("a", Decimal::ZERO, true);
        let oracle = oracle_with(vec![a]);
        oracle.seed_last_known("WBNB", Decimal::from(580));

        let price = oracle.price_usd(wbnb()).await.unwrap();
        assert_eq!(price, Decimal::from(580));
    }

    #[tokio::test]
    async fn sentinel_default_when_nothing_ever_cached() {
        let a = FakeSource::new("a", Decimal::ZERO, true);
        let oracle = oracle_with(vec![a]);

        let price = oracle.price_usd(wbnb()).await.unwrap();
        assert_eq!(price, Decimal::from(600));
    }

    #[tokio::test]
    async fn gated_provider_is_skipped_without_a_call() {
        let a = Arc::new(FakeSource {
            name: "a",
            gate: RateGate::new(Duration::from_secs(60)),
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            price: Decimal::from(100),
        });
        // Consume a's gate so the oracle must skip it.
        assert!(a.gate.try_pass());
        let b = FakeSource::new("b", Decimal::from(200), false);
        let oracle = oracle_with(vec![a.clone(), b]);

        let price = oracle.price_usd(wbnb()).await.unwrap();
        assert_eq!(price, Decimal::from(200));
        assert_eq!(a.calls.load(Ordering::SeqCst), 0);
    }
}
