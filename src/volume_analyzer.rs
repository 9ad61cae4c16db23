// Volume analyzer - trading activity for a single pair, via the exchange
// subgraph first and the DexScreener pair endpoint when the indexer has not
// caught up. Unlike pricing, volume fetches wait out their rate gates instead
// of skipping a provider, so every lookup gets a real attempt at each source.

use crate::cascade::{first_success, CascadeSource, GatePolicy, RateGate};
use crate::settings::VolumeSettings;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use ethers::types::Address;
use log::{debug, warn};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const FIFTEEN_MINUTES: i64 = 15 * 60;
const ONE_HOUR: i64 = 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeSource {
    Indexer,
    Aggregator,
}

impl VolumeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeSource::Indexer => "indexer",
            VolumeSource::Aggregator => "aggregator",
        }
    }
}

#[derive(Debug, Clone)]
pub struct VolumeSample {
    pub volume_24h_usd: Decimal,
    pub swap_count_15m: u32,
    pub swap_count_1h: u32,
    /// False means both providers failed and the counts are zero-filled, not
    /// observed. Classification treats that as "activity unknown".
    pub success: bool,
    pub source: Option<VolumeSource>,
}

impl VolumeSample {
    /// Non-error empty sample; returned when every provider fails so that a
    /// volume outage never blocks pair classification.
    pub fn unavailable() -> Self {
        Self {
            volume_24h_usd: Decimal::ZERO,
            swap_count_15m: 0,
            swap_count_1h: 0,
            success: false,
            source: None,
        }
    }
}

/// Seam the classifier depends on; lets tests inject activity data.
#[async_trait]
pub trait VolumeProbe: Send + Sync {
    async fn analyze_pair(&self, pair: Address) -> VolumeSample;
}

pub struct VolumeAnalyzer {
    sources: Vec<Arc<dyn CascadeSource<Address, VolumeSample>>>,
}

impl VolumeAnalyzer {
    pub fn new(sources: Vec<Arc<dyn CascadeSource<Address, VolumeSample>>>) -> Self {
        Self { sources }
    }

    pub fn from_settings(settings: &VolumeSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.http_timeout_ms))
            .build()
            .context("failed to build volume http client")?;

        Ok(Self::new(vec![
            Arc::new(SubgraphSource::new(
                client.clone(),
                settings.subgraph_url.clone(),
                Duration::from_millis(settings.indexer_interval_ms),
            )),
            Arc::new(DexScreenerPairSource::new(
                client,
                settings.dexscreener_url.clone(),
                settings.dexscreener_chain.clone(),
                Duration::from_millis(settings.aggregator_interval_ms),
            )),
        ]))
    }
}

#[async_trait]
impl VolumeProbe for VolumeAnalyzer {
    async fn analyze_pair(&self, pair: Address) -> VolumeSample {
        match first_success(&self.sources, &pair, GatePolicy::WaitWhenLimited).await {
            Ok((sample, source)) => {
                debug!(
                    "[volume] {:#x}: ${} 24h, {} swaps/15m via {}",
                    pair, sample.volume_24h_usd, sample.swap_count_15m, source
                );
                sample
            }
            Err(e) => {
                warn!(
                    "[volume] No provider could sample {:#x} ({}); reporting unavailable",
                    pair, e
                );
                VolumeSample::unavailable()
            }
        }
    }
}

// ---- subgraph (graph indexer) ----

#[derive(Debug, Deserialize)]
struct GraphResponse {
    data: Option<GraphData>,
    errors: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GraphData {
    #[serde(rename = "pairDayDatas")]
    pair_day_datas: Option<Vec<PairDayData>>,
    swaps: Option<Vec<GraphSwap>>,
}

#[derive(Debug, Deserialize)]
struct PairDayData {
    #[serde(rename = "dailyVolumeUSD")]
    daily_volume_usd: String,
}

#[derive(Debug, Deserialize)]
struct GraphSwap {
    timestamp: String,
}

/// GraphQL query against the exchange subgraph: current-day volume plus the
/// raw swap timestamps of the last hour.
pub struct SubgraphSource {
    client: reqwest::Client,
    url: String,
    gate: RateGate,
}

impl SubgraphSource {
    pub fn new(client: reqwest::Client, url: String, interval: Duration) -> Self {
        Self {
            client,
            url,
            gate: RateGate::new(interval),
        }
    }
}

#[async_trait]
impl CascadeSource<Address, VolumeSample> for SubgraphSource {
    fn name(&self) -> &'static str {
        "subgraph"
    }

    fn gate(&self) -> &RateGate {
        &self.gate
    }

    async fn fetch(&self, pair: &Address) -> Result<VolumeSample> {
        let now = Utc::now().timestamp();
        let pair_id = format!("{:#x}", pair);
        let query = format!(
            r#"{{
              pairDayDatas(first: 1, orderBy: date, orderDirection: desc,
                           where: {{ pairAddress: "{pair_id}" }}) {{
                dailyVolumeUSD
              }}
              swaps(first: 1000, orderBy: timestamp, orderDirection: desc,
                    where: {{ pair: "{pair_id}", timestamp_gt: {since} }}) {{
                timestamp
              }}
            }}"#,
            pair_id = pair_id,
            since = now - ONE_HOUR,
        );

        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "query": query }))
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("http {}", response.status());
        }
        let body: GraphResponse = response.json().await?;
        if let Some(errors) = body.errors {
            anyhow::bail!("graphql errors: {}", errors);
        }
        let data = body.data.ok_or_else(|| anyhow!("empty graphql response"))?;

        let day_datas = data
            .pair_day_datas
            .ok_or_else(|| anyhow!("pairDayDatas missing"))?;
        // New pairs are usually not indexed yet; treat that as a miss so the
        // aggregator gets a chance.
        let day = day_datas
            .first()
            .ok_or_else(|| anyhow!("pair {} not indexed yet", pair_id))?;
        let volume_24h_usd: Decimal = day
            .daily_volume_usd
            .parse()
            .with_context(|| format!("unparseable dailyVolumeUSD {:?}", day.daily_volume_usd))?;

        let timestamps: Vec<i64> = data
            .swaps
            .unwrap_or_default()
            .iter()
            .filter_map(|s| s.timestamp.parse().ok())
            .collect();
        let (swap_count_15m, swap_count_1h) = count_swap_windows(&timestamps, now);

        Ok(VolumeSample {
            volume_24h_usd,
            swap_count_15m,
            swap_count_1h,
            success: true,
            source: Some(VolumeSource::Indexer),
        })
    }
}

// ---- DexScreener (aggregator) ----

#[derive(Debug, Deserialize)]
struct DexScreenerPairResponse {
    pairs: Option<Vec<DexScreenerPair>>,
}

#[derive(Debug, Deserialize)]
struct DexScreenerPair {
    volume: Option<DexScreenerVolume>,
    txns: Option<DexScreenerTxns>,
}

#[derive(Debug, Deserialize)]
struct DexScreenerVolume {
    h24: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct DexScreenerTxns {
    h1: Option<DexScreenerTxnCounts>,
}

#[derive(Debug, Deserialize)]
struct DexScreenerTxnCounts {
    buys: Option<u32>,
    sells: Option<u32>,
}

/// The aggregator has no 15-minute bucket; the finest it reports is hourly
/// transaction counts, so the 15-minute figure is estimated as a quarter of
/// the hourly count.
pub struct DexScreenerPairSource {
    client: reqwest::Client,
    base_url: String,
    chain: String,
    gate: RateGate,
}

impl DexScreenerPairSource {
    pub fn new(client: reqwest::Client, base_url: String, chain: String, interval: Duration) -> Self {
        Self {
            client,
            base_url,
            chain,
            gate: RateGate::new(interval),
        }
    }
}

#[async_trait]
impl CascadeSource<Address, VolumeSample> for DexScreenerPairSource {
    fn name(&self) -> &'static str {
        "dexscreener"
    }

    fn gate(&self) -> &RateGate {
        &self.gate
    }

    async fn fetch(&self, pair: &Address) -> Result<VolumeSample> {
        let url = format!(
            "{}/latest/dex/pairs/{}/{:#x}",
            self.base_url, self.chain, pair
        );
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("http {}", response.status());
        }
        let body: DexScreenerPairResponse = response.json().await?;
        let entry = body
            .pairs
            .unwrap_or_default()
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("pair {:#x} unknown to aggregator", pair))?;

        let volume_24h_usd = entry
            .volume
            .and_then(|v| v.h24)
            .and_then(Decimal::from_f64)
            .unwrap_or(Decimal::ZERO);
        let swap_count_1h = entry
            .txns
            .and_then(|t| t.h1)
            .map(|c| c.buys.unwrap_or(0) + c.sells.unwrap_or(0))
            .unwrap_or(0);

        Ok(VolumeSample {
            volume_24h_usd,
            swap_count_15m: estimate_15m_from_1h(swap_count_1h),
            swap_count_1h,
            success: true,
            source: Some(VolumeSource::Aggregator),
        })
    }
}

/// Counts swaps inside the 15-minute and 1-hour windows ending at `now`.
fn count_swap_windows(timestamps: &[i64], now: i64) -> (u32, u32) {
    let mut recent = 0u32;
    let mut hourly = 0u32;
    for &ts in timestamps {
        if ts > now - ONE_HOUR {
            hourly += 1;
            if ts > now - FIFTEEN_MINUTES {
                recent += 1;
            }
        }
    }
    (recent, hourly)
}

fn estimate_15m_from_1h(count_1h: u32) -> u32 {
    count_1h / 4
}
