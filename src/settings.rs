use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HealthCheck {
    pub interval_seconds: u64,
    /// Endpoints averaging above this latency are candidates for a proactive
    /// cursor switch during the health pass.
    pub slow_endpoint_threshold_ms: u64,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            interval_seconds: default_health_interval_seconds(),
            slow_endpoint_threshold_ms: default_slow_endpoint_threshold_ms(),
        }
    }
}

fn default_health_interval_seconds() -> u64 {
    60
}
fn default_slow_endpoint_threshold_ms() -> u64 {
    3000
}
fn default_max_response_time_ms() -> u64 {
    5000
}
fn default_qps_limit() -> u32 {
    50
}
fn default_failure_threshold() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RpcSettings {
    pub http_urls: Vec<String>,
    pub ws_url: Option<String>,
    #[serde(default = "default_max_response_time_ms")]
    pub max_response_time_ms: u64,
    #[serde(default = "default_qps_limit")]
    pub qps_limit: u32,
    /// Consecutive failures beyond this count flip an endpoint unhealthy.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    pub health_check: HealthCheck,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            http_urls: vec![
                "https://bsc-dataseed.binance.org".to_string(),
                "https://bsc-dataseed1.defibit.io".to_string(),
                "https://bsc-dataseed1.ninicoin.io".to_string(),
            ],
            ws_url: None,
            max_response_time_ms: default_max_response_time_ms(),
            qps_limit: default_qps_limit(),
            failure_threshold: default_failure_threshold(),
            health_check: HealthCheck::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheSettings {
    /// None disables the external backend entirely; a configured-but-unreachable
    /// backend is also supported and demotes to the in-process map at startup.
    pub redis_url: Option<String>,
    pub price_ttl_seconds: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            redis_url: Some("redis://127.0.0.1:6379".to_string()),
            price_ttl_seconds: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PricingSettings {
    pub coingecko_url: String,
    pub dexscreener_url: String,
    pub binance_url: String,
    pub coingecko_interval_ms: u64,
    pub dexscreener_interval_ms: u64,
    pub binance_interval_ms: u64,
    pub http_timeout_ms: u64,
    /// Sentinel returned when every provider fails and nothing was ever cached.
    pub default_native_price_usd: f64,
}

impl Default for PricingSettings {
    fn default() -> Self {
        Self {
            coingecko_url: "https://api.coingecko.com/api/v3".to_string(),
            dexscreener_url: "https://api.dexscreener.com".to_string(),
            binance_url: "https://api.binance.com".to_string(),
            coingecko_interval_ms: 10_000,
            dexscreener_interval_ms: 2_000,
            binance_interval_ms: 1_000,
            http_timeout_ms: 5_000,
            default_native_price_usd: 600.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WrappedNativeToken {
    pub address: String,
    pub symbol: String,
    pub decimals: u32,
    pub coingecko_id: String,
    pub ticker: String,
}

impl Default for WrappedNativeToken {
    fn default() -> Self {
        Self {
            address: "0xbb4CdB9CBd36B01bD1cBaEBF2De08d9173bc095c".to_string(),
            symbol: "WBNB".to_string(),
            decimals: 18,
            coingecko_id: "binancecoin".to_string(),
            ticker: "BNBUSDT".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StableToken {
    pub address: String,
    pub symbol: String,
    pub decimals: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TokenSettings {
    pub wrapped_native: WrappedNativeToken,
    pub stables: Vec<StableToken>,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            wrapped_native: WrappedNativeToken::default(),
            stables: vec![
                StableToken {
                    address: "0xe9e7CEA3DedcA5984780Bafc599bD69ADd087D56".to_string(),
                    symbol: "BUSD".to_string(),
                    decimals: 18,
                },
                StableToken {
                    address: "0x55d398326f99059fF775485246999027B3197955".to_string(),
                    symbol: "USDT".to_string(),
                    decimals: 18,
                },
                StableToken {
                    address: "0x8AC76a51cc950d9822D68b83fE1Ad97B32Cd580d".to_string(),
                    symbol: "USDC".to_string(),
                    decimals: 18,
                },
            ],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct VolumeSettings {
    pub subgraph_url: String,
    pub dexscreener_url: String,
    pub dexscreener_chain: String,
    pub indexer_interval_ms: u64,
    pub aggregator_interval_ms: u64,
    pub http_timeout_ms: u64,
}

impl Default for VolumeSettings {
    fn default() -> Self {
        Self {
            subgraph_url: "https://api.thegraph.com/subgraphs/name/pancakeswap/exchange"
                .to_string(),
            dexscreener_url: "https://api.dexscreener.com".to_string(),
            dexscreener_chain: "bsc".to_string(),
            indexer_interval_ms: 2_000,
            aggregator_interval_ms: 2_000,
            http_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DetectorSettings {
    pub factory_address: String,
    pub poll_interval_seconds: u64,
    pub backfill_interval_seconds: u64,
    /// Upper bound on pairs fetched per backfill sweep; the remainder is
    /// picked up next tick.
    pub max_backfill_pairs: u64,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            // PancakeSwap V2 factory
            factory_address: "0xcA143Ce32Fe78f1f7019d7d551a6402fC5350c73".to_string(),
            poll_interval_seconds: 30,
            backfill_interval_seconds: 60,
            max_backfill_pairs: 50,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TierSettings {
    pub early_min_usd: f64,
    pub channel_a_min_usd: f64,
    pub channel_b_min_usd: f64,
    pub mega_min_usd: f64,
    pub early_volume_min_usd: f64,
    pub early_swaps_min: u32,
}

impl Default for TierSettings {
    fn default() -> Self {
        Self {
            early_min_usd: 1_000.0,
            channel_a_min_usd: 10_000.0,
            channel_b_min_usd: 35_000.0,
            mega_min_usd: 50_000.0,
            early_volume_min_usd: 5_000.0,
            early_swaps_min: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExplorerSettings {
    pub base_url: Option<String>,
    pub api_key: String,
    pub http_timeout_ms: u64,
    pub max_retries: usize,
}

impl Default for ExplorerSettings {
    fn default() -> Self {
        Self {
            base_url: Some("https://api.bscscan.com/api".to_string()),
            api_key: String::new(),
            http_timeout_ms: 10_000,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub rpc: RpcSettings,
    pub cache: CacheSettings,
    pub pricing: PricingSettings,
    pub tokens: TokenSettings,
    pub volume: VolumeSettings,
    pub detector: DetectorSettings,
    pub tiers: TierSettings,
    pub explorer: ExplorerSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name("Config.toml").required(false))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;

        // Environment variable overrides for deploy-time configuration
        if let Ok(raw) = env::var("PAIRWATCH_RPC_HTTP_URLS") {
            if let Some(list) = parse_string_list(&raw) {
                if !list.is_empty() {
                    settings.rpc.http_urls = list;
                }
            }
        }
        if let Ok(ws) = env::var("PAIRWATCH_RPC_WS_URL") {
            let trimmed = ws.trim();
            if !trimmed.is_empty() {
                settings.rpc.ws_url = Some(trimmed.to_string());
            }
        }
        if let Ok(factory) = env::var("PAIRWATCH_FACTORY_ADDRESS") {
            if !factory.trim().is_empty() {
                settings.detector.factory_address = factory.trim().to_string();
            }
        }
        if let Ok(redis) = env::var("PAIRWATCH_REDIS_URL") {
            let trimmed = redis.trim();
            settings.cache.redis_url = if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            };
        }
        if let Ok(subgraph) = env::var("PAIRWATCH_SUBGRAPH_URL") {
            if !subgraph.trim().is_empty() {
                settings.volume.subgraph_url = subgraph.trim().to_string();
            }
        }
        if let Ok(key) = env::var("PAIRWATCH_EXPLORER_API_KEY") {
            settings.explorer.api_key = key.trim().to_string();
        }

        Ok(settings)
    }
}

/// Accepts either a JSON array (`["a","b"]`) or a comma-separated list.
fn parse_string_list(input: &str) -> Option<Vec<String>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Some(vec![]);
    }

    if trimmed.starts_with('[') {
        if let Ok(v) = serde_json::from_str::<Vec<String>>(trimmed) {
            return Some(v);
        }
    }

    Some(
        trimmed
            .split(',')
            .map(|s| s.trim().trim_matches('"').to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert!(!settings.rpc.http_urls.is_empty());
        assert_eq!(settings.rpc.max_response_time_ms, 5000);
        assert_eq!(settings.rpc.failure_threshold, 3);
        assert_eq!(settings.cache.price_ttl_seconds, 60);
        assert_eq!(settings.tiers.mega_min_usd, 50_000.0);
        assert_eq!(settings.tiers.early_swaps_min, 10);
        assert_eq!(settings.detector.poll_interval_seconds, 30);
        assert_eq!(settings.detector.backfill_interval_seconds, 60);
    }

    #[test]
    fn parses_comma_separated_list() {
        let list = parse_string_list("https://a.example, https://b.example").unwrap();
        assert_eq!(list, vec!["https://a.example", "https://b.example"]);
    }

    #[test]
    fn parses_json_list() {
        let list = parse_string_list(r#"["https://a.example","https://b.example"]"#).unwrap();
        assert_eq!(list.len(), 2);
    }
}
