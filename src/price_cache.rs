// Price cache - Redis-backed when reachable, in-process map otherwise.
//
// The two backends are interchangeable storage strategies for the same logical
// entry; only one is authoritative at a time. A failed Redis connection at
// startup permanently demotes to in-process mode for the life of the process.
// A single failed write only falls back for that one entry.

use anyhow::{Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info, warn};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedPrice {
    pub symbol: String,
    pub price_usd: rust_decimal::Decimal,
    /// Unix timestamp of the successful upstream fetch.
    pub observed_at: i64,
}

impl CachedPrice {
    pub fn now(symbol: &str, price_usd: rust_decimal::Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            price_usd,
            observed_at: Utc::now().timestamp(),
        }
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        let age = Utc::now().timestamp().saturating_sub(self.observed_at);
        age >= 0 && (age as u64) < ttl.as_secs().max(1)
    }
}

pub struct PriceCache {
    /// Present only when the startup connection succeeded.
    redis: Option<Mutex<ConnectionManager>>,
    local: DashMap<String, CachedPrice>,
    ttl: Duration,
}

impl PriceCache {
    /// Connects to the external backend when a URL is configured. Connection
    /// failure is a supported state: it is logged once and the cache operates
    /// on the in-process map for the rest of the process lifetime.
    pub async fn connect(redis_url: Option<&str>, ttl: Duration) -> Self {
        let redis = match redis_url {
            Some(url) => match Self::try_connect(url).await {
                Ok(conn) => {
                    info!("[price_cache] Connected to external cache at {}", url);
                    Some(Mutex::new(conn))
                }
                Err(e) => {
                    warn!(
                        "[price_cache] External cache unavailable ({}); using in-process map",
                        e
                    );
                    None
                }
            },
            None => {
                info!("[price_cache] No external cache configured; using in-process map");
                None
            }
        };

        Self {
            redis,
            local: DashMap::new(),
            ttl,
        }
    }

    /// In-process-only cache, used by tests and by deployments without Redis.
    pub fn in_process(ttl: Duration) -> Self {
        Self {
            redis: None,
            local: DashMap::new(),
            ttl,
        }
    }

    pub fn backend_available(&self) -> bool {
        self.redis.is_some()
    }

    async fn try_connect(url: &str) -> Result<ConnectionManager> {
        let client = redis::Client::open(url).context("failed to create redis client")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;
        Ok(conn)
    }

    /// Fresh (non-expired) entry, or None on miss/expiry.
    pub async fn get(&self, symbol: &str) -> Option<CachedPrice> {
        if let Some(redis) = &self.redis {
            let key = Self::key(symbol);
            let mut conn = redis.lock().await;
            match conn.get::<_, Option<Vec<u8>>>(&key).await {
                Ok(Some(bytes)) => match bincode::deserialize::<CachedPrice>(&bytes) {
                    Ok(entry) => {
                        debug!("[price_cache] Redis hit for {}", symbol);
                        return Some(entry);
                    }
                    Err(e) => {
                        warn!("[price_cache] Corrupt cache entry for {}: {}", symbol, e);
                        return None;
                    }
                },
                Ok(None) => return None,
                Err(e) => {
                    // Read error does not demote the backend; fall back to the
                    // in-process map for this one lookup.
                    debug!("[price_cache] Redis read failed for {}: {}", symbol, e);
                }
            }
        }

        self.local
            .get(symbol)
            .filter(|entry| entry.is_fresh(self.ttl))
            .map(|entry| entry.clone())
    }

    /// Writes through to the active backend. A Redis write error falls back to
    /// the in-process map for this entry only.
    pub async fn put(&self, entry: CachedPrice) {
        if let Some(redis) = &self.redis {
            let key = Self::key(&entry.symbol);
            match bincode::serialize(&entry) {
                Ok(bytes) => {
                    let mut conn = redis.lock().await;
                    match conn
                        .set_ex::<_, _, ()>(&key, bytes, self.ttl.as_secs().max(1))
                        .await
                    {
                        Ok(()) => {
                            debug!("[price_cache] Cached {} in redis", entry.symbol);
                            return;
                        }
                        Err(e) => {
                            warn!(
                                "[price_cache] Redis write failed for {} ({}); caching in-process",
                                entry.symbol, e
                            );
                        }
                    }
                }
                Err(e) => {
                    warn!("[price_cache] Failed to serialize entry: {}", e);
                }
            }
        }

        self.local.insert(entry.symbol.clone(), entry);
    }

    fn key(symbol: &str) -> String {
        format!("price:usd:{}", symbol)
    }
}
