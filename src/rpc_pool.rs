// src/rpc_pool.rs
//
// Multi-endpoint RPC pool with health tracking and sticky-cursor failover.
// Every blockchain read in the crate goes through `execute_with_failover`.

use crate::settings::Settings;
use anyhow::Result;
use ethers::middleware::Middleware;
use ethers::prelude::{Http, Provider};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::{sleep, timeout};

type DefaultDirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rolling latency window per endpoint.
const LATENCY_WINDOW: usize = 20;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no rpc endpoints configured")]
    NoEndpoints,
    #[error("no healthy rpc endpoints available")]
    NoHealthyEndpoints,
    #[error("all rpc providers exhausted for {label}: {last_error}")]
    AllProvidersExhausted { label: String, last_error: String },
}

/// Per-endpoint connection state. Created once at pool construction and
/// mutated by call attempts and health probes until shutdown.
#[derive(Debug)]
struct EndpointState {
    url: String,
    provider: Option<Arc<Provider<Http>>>,
    healthy: bool,
    last_checked: Option<Instant>,
    recent_latencies_ms: Vec<u64>,
    consecutive_failures: u32,
}

impl EndpointState {
    fn new(url: String, provider: Option<Arc<Provider<Http>>>) -> Self {
        Self {
            url,
            provider,
            healthy: true,
            last_checked: None,
            recent_latencies_ms: Vec::with_capacity(LATENCY_WINDOW),
            consecutive_failures: 0,
        }
    }

    fn record_latency(&mut self, ms: u64) {
        self.recent_latencies_ms.push(ms);
        if self.recent_latencies_ms.len() > LATENCY_WINDOW {
            self.recent_latencies_ms.remove(0);
        }
    }

    fn avg_latency_ms(&self) -> Option<u64> {
        if self.recent_latencies_ms.is_empty() {
            return None;
        }
        let sum: u64 = self.recent_latencies_ms.iter().sum();
        Some(sum / self.recent_latencies_ms.len() as u64)
    }
}

#[derive(Debug)]
struct PoolInner {
    endpoints: Vec<EndpointState>,
    /// Active-endpoint cursor. Advanced only by the failover algorithm and the
    /// proactive health-pass switch, never by callers.
    cursor: usize,
}

/// Point-in-time view of one endpoint, for the stats surface.
#[derive(Debug, Clone)]
pub struct EndpointSnapshot {
    pub url: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub avg_latency_ms: Option<u64>,
    pub last_checked_ms_ago: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total_requests: u64,
    pub total_failures: u64,
    pub failover_events: u64,
    pub endpoints: Vec<EndpointSnapshot>,
}

/// Pool of RPC endpoints with automatic failover.
///
/// The cursor is sticky: once failover moves it, subsequent calls start from
/// the new position. A periodic health pass re-probes every endpoint,
/// reconnects dead ones, and may move the cursor off a slow endpoint.
#[derive(Debug)]
pub struct RpcEndpointPool {
    inner: Mutex<PoolInner>,
    limiter: DefaultDirectRateLimiter,
    max_response_time: Duration,
    failure_threshold: u32,
    health_interval: Duration,
    slow_endpoint_threshold_ms: u64,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    failover_events: AtomicU64,
}

impl RpcEndpointPool {
    /// Builds the pool from the configured URLs. Endpoints are assumed healthy
    /// until probed; call `connect()` before serving traffic.
    pub fn new(settings: &Settings) -> Result<Self, PoolError> {
        let endpoints: Vec<EndpointState> = settings
            .rpc
            .http_urls
            .iter()
            .filter_map(|url| match Provider::<Http>::try_from(url.as_str()) {
                Ok(p) => Some(EndpointState::new(url.clone(), Some(Arc::new(p)))),
                Err(e) => {
                    warn!("[rpc_pool] Skipping malformed endpoint url {}: {}", url, e);
                    None
                }
            })
            .collect();

        if endpoints.is_empty() {
            return Err(PoolError::NoEndpoints);
        }

        let quota = Quota::per_second(
            NonZeroU32::new(settings.rpc.qps_limit.max(1)).expect("qps_limit clamped to >= 1"),
        );

        Ok(Self {
            inner: Mutex::new(PoolInner {
                endpoints,
                cursor: 0,
            }),
            limiter: RateLimiter::direct(quota),
            max_response_time: Duration::from_millis(settings.rpc.max_response_time_ms),
            failure_threshold: settings.rpc.failure_threshold,
            health_interval: Duration::from_secs(settings.rpc.health_check.interval_seconds),
            slow_endpoint_threshold_ms: settings.rpc.health_check.slow_endpoint_threshold_ms,
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            failover_events: AtomicU64::new(0),
        })
    }

    /// Startup probe round: pings every endpoint and fails hard only if all
    /// of them are unreachable (fatal startup condition).
    pub async fn connect(&self) -> Result<()> {
        let targets = self.snapshot_providers();
        let mut reachable = 0usize;

        for (idx, url, provider) in targets {
            let provider = match provider {
                Some(p) => p,
                None => continue,
            };
            let start = Instant::now();
            match timeout(self.max_response_time, provider.get_block_number()).await {
                Ok(Ok(block)) => {
                    let ms = start.elapsed().as_millis() as u64;
                    self.mark_probe_success(idx, ms);
                    reachable += 1;
                    info!(
                        "[rpc_pool] Endpoint {} reachable (block {}, {}ms)",
                        url, block, ms
                    );
                }
                Ok(Err(e)) => {
                    self.mark_probe_failure(idx);
                    warn!("[rpc_pool] Endpoint {} unreachable at startup: {}", url, e);
                }
                Err(_) => {
                    self.mark_probe_failure(idx);
                    warn!(
                        "[rpc_pool] Endpoint {} timed out at startup (>{:?})",
                        url, self.max_response_time
                    );
                }
            }
        }

        if reachable == 0 {
            anyhow::bail!("no RPC endpoint reachable at initialization");
        }

        // Make sure the cursor starts on a live endpoint.
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.endpoints[inner.cursor].healthy {
                if let Some(next) = Self::next_healthy(&inner.endpoints, inner.cursor, &HashSet::new())
                {
                    inner.cursor = next;
                }
            }
        }

        info!(
            "[rpc_pool] Connected: {}/{} endpoints reachable",
            reachable,
            self.provider_count()
        );
        Ok(())
    }

    /// Executes `op` against the active endpoint, failing over across the pool
    /// on error or timeout. Each configured endpoint is tried at most once per
    /// call; the aggregate error carries the last underlying failure.
    pub async fn execute_with_failover<T, F, Fut>(&self, label: &str, op: F) -> Result<T>
    where
        F: Fn(Arc<Provider<Http>>, String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.total_requests.fetch_add(1, Ordering::SeqCst);

        let endpoint_count = self.provider_count();
        let mut tried: HashSet<usize> = HashSet::new();
        let mut last_error: Option<String> = None;

        for _ in 0..endpoint_count {
            let (idx, provider, url) = match self.select_active(&tried) {
                Some(sel) => sel,
                None => break,
            };
            tried.insert(idx);

            self.limiter.until_ready().await;

            let start = Instant::now();
            let outcome = timeout(self.max_response_time, op(provider, url.clone())).await;
            let elapsed_ms = start.elapsed().as_millis() as u64;

            match outcome {
                Ok(Ok(value)) => {
                    self.mark_call_success(idx, elapsed_ms);
                    return Ok(value);
                }
                Ok(Err(e)) => {
                    last_error = Some(e.to_string());
                    debug!("[rpc_pool] {} failed on {}: {}", label, url, e);
                }
                Err(_) => {
                    last_error = Some(format!(
                        "timed out after {}ms",
                        self.max_response_time.as_millis()
                    ));
                    debug!("[rpc_pool] {} timed out on {}", label, url);
                }
            }

            self.total_failures.fetch_add(1, Ordering::SeqCst);
            self.mark_call_failure(idx, label);
            self.advance_cursor_from(idx, &tried);
        }

        let last_error = last_error.unwrap_or_else(|| "no healthy rpc endpoints available".into());
        Err(PoolError::AllProvidersExhausted {
            label: label.to_string(),
            last_error,
        }
        .into())
    }

    /// Spawns the periodic health-check loop. Probe failures are swallowed;
    /// they only flip the target endpoint's health flag.
    pub fn spawn_health_checker(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                sleep(pool.health_interval).await;
                debug!("[rpc_pool] Running endpoint health pass");
                pool.run_health_pass().await;
            }
        })
    }

    /// One health pass: re-probe every endpoint (reconnecting dead ones) and
    /// proactively move the cursor off a slow endpoint when a strictly faster
    /// healthy one exists.
    pub async fn run_health_pass(&self) {
        self.run_health_pass_with(|provider, _url| async move {
            provider.get_block_number().await?;
            Ok(())
        })
        .await
    }

    /// Health pass with an injectable probe, mirroring the closure style of
    /// `execute_with_failover` so probe outcomes can be scripted per endpoint.
    pub async fn run_health_pass_with<F, Fut>(&self, probe: F)
    where
        F: Fn(Arc<Provider<Http>>, String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let targets = self.snapshot_providers();

        for (idx, url, provider) in targets {
            // Reconnect endpoints whose handle was dropped.
            let provider = match provider {
                Some(p) => p,
                None => match Provider::<Http>::try_from(url.as_str()) {
                    Ok(p) => {
                        let p = Arc::new(p);
                        let mut inner = self.inner.lock().unwrap();
                        inner.endpoints[idx].provider = Some(p.clone());
                        p
                    }
                    Err(e) => {
                        warn!("[rpc_pool] Could not rebuild provider for {}: {}", url, e);
                        continue;
                    }
                },
            };

            let start = Instant::now();
            match timeout(self.max_response_time, probe(provider, url.clone())).await {
                Ok(Ok(())) => {
                    let ms = start.elapsed().as_millis() as u64;
                    let was_dead = {
                        let inner = self.inner.lock().unwrap();
                        !inner.endpoints[idx].healthy
                    };
                    self.mark_probe_success(idx, ms);
                    if was_dead {
                        info!("[rpc_pool] Endpoint {} is back online", url);
                    }
                }
                Ok(Err(e)) => {
                    debug!("[rpc_pool] Health probe failed for {}: {}", url, e);
                    self.mark_probe_failure(idx);
                }
                Err(_) => {
                    debug!("[rpc_pool] Health probe timed out for {}", url);
                    self.mark_probe_failure(idx);
                }
            }
        }

        self.maybe_switch_off_slow_endpoint();
    }

    pub fn provider_count(&self) -> usize {
        self.inner.lock().unwrap().endpoints.len()
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().unwrap();
        let endpoints = inner
            .endpoints
            .iter()
            .map(|e| EndpointSnapshot {
                url: e.url.clone(),
                healthy: e.healthy,
                consecutive_failures: e.consecutive_failures,
                avg_latency_ms: e.avg_latency_ms(),
                last_checked_ms_ago: e.last_checked.map(|t| t.elapsed().as_millis() as u64),
            })
            .collect();

        PoolStats {
            total_requests: self.total_requests.load(Ordering::SeqCst),
            total_failures: self.total_failures.load(Ordering::SeqCst),
            failover_events: self.failover_events.load(Ordering::SeqCst),
            endpoints,
        }
    }

    // ---- internals ----

    fn snapshot_providers(&self) -> Vec<(usize, String, Option<Arc<Provider<Http>>>)> {
        let inner = self.inner.lock().unwrap();
        inner
            .endpoints
            .iter()
            .enumerate()
            .map(|(i, e)| (i, e.url.clone(), e.provider.clone()))
            .collect()
    }

    /// Picks the endpoint the call should use: the cursor position when it is
    /// healthy and untried, otherwise the next healthy untried endpoint in
    /// pool order. The cursor follows the selection.
    fn select_active(&self, tried: &HashSet<usize>) -> Option<(usize, Arc<Provider<Http>>, String)> {
        let mut inner = self.inner.lock().unwrap();
        let start = inner.cursor;
        let idx = Self::next_healthy_from(&inner.endpoints, start, tried)?;
        inner.cursor = idx;
        let endpoint = &inner.endpoints[idx];
        let provider = endpoint.provider.clone()?;
        Some((idx, provider, endpoint.url.clone()))
    }

    /// First healthy, untried index scanning from `start` inclusive, wrapping.
    fn next_healthy_from(
        endpoints: &[EndpointState],
        start: usize,
        tried: &HashSet<usize>,
    ) -> Option<usize> {
        let n = endpoints.len();
        (0..n)
            .map(|offset| (start + offset) % n)
            .find(|&i| endpoints[i].healthy && endpoints[i].provider.is_some() && !tried.contains(&i))
    }

    /// First healthy index strictly after `start`, wrapping.
    fn next_healthy(
        endpoints: &[EndpointState],
        start: usize,
        tried: &HashSet<usize>,
    ) -> Option<usize> {
        let n = endpoints.len();
        (1..=n)
            .map(|offset| (start + offset) % n)
            .find(|&i| endpoints[i].healthy && !tried.contains(&i))
    }

    fn mark_call_success(&self, idx: usize, elapsed_ms: u64) {
        let mut inner = self.inner.lock().unwrap();
        let endpoint = &mut inner.endpoints[idx];
        endpoint.consecutive_failures = 0;
        endpoint.last_checked = Some(Instant::now());
        endpoint.record_latency(elapsed_ms);
    }

    fn mark_call_failure(&self, idx: usize, label: &str) {
        let mut inner = self.inner.lock().unwrap();
        let threshold = self.failure_threshold;
        let endpoint = &mut inner.endpoints[idx];
        endpoint.consecutive_failures += 1;
        endpoint.last_checked = Some(Instant::now());
        if endpoint.consecutive_failures > threshold && endpoint.healthy {
            endpoint.healthy = false;
            warn!(
                "[rpc_pool] Endpoint {} marked unhealthy after {} consecutive failures (op: {})",
                endpoint.url, endpoint.consecutive_failures, label
            );
        }
    }

    /// Advances the sticky cursor to the next healthy endpoint after `from`.
    /// Counts one failover event when the cursor actually moves.
    fn advance_cursor_from(&self, from: usize, tried: &HashSet<usize>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(next) = Self::next_healthy(&inner.endpoints, from, tried) {
            if next != from {
                let from_url = inner.endpoints[from].url.clone();
                let to_url = inner.endpoints[next].url.clone();
                inner.cursor = next;
                self.failover_events.fetch_add(1, Ordering::SeqCst);
                info!("[rpc_pool] Failover: {} -> {}", from_url, to_url);
            }
        }
    }

    fn mark_probe_success(&self, idx: usize, elapsed_ms: u64) {
        let mut inner = self.inner.lock().unwrap();
        let endpoint = &mut inner.endpoints[idx];
        endpoint.healthy = true;
        endpoint.consecutive_failures = 0;
        endpoint.last_checked = Some(Instant::now());
        endpoint.record_latency(elapsed_ms);
    }

    fn mark_probe_failure(&self, idx: usize) {
        let mut inner = self.inner.lock().unwrap();
        let endpoint = &mut inner.endpoints[idx];
        endpoint.healthy = false;
        endpoint.last_checked = Some(Instant::now());
    }

    /// If the active endpoint averages above the slow threshold and a strictly
    /// faster healthy endpoint exists, move the cursor to the first such
    /// candidate in pool order.
    fn maybe_switch_off_slow_endpoint(&self) {
        let mut inner = self.inner.lock().unwrap();
        let cursor = inner.cursor;
        let current_avg = match inner.endpoints[cursor].avg_latency_ms() {
            Some(avg) if avg > self.slow_endpoint_threshold_ms => avg,
            _ => return,
        };

        let candidate = inner
            .endpoints
            .iter()
            .enumerate()
            .find(|(i, e)| {
                *i != cursor
                    && e.healthy
                    && e.avg_latency_ms().map(|a| a < current_avg).unwrap_or(false)
            })
            .map(|(i, e)| (i, e.url.clone(), e.avg_latency_ms()));

        if let Some((idx, to_url, to_avg)) = candidate {
            let from_url = inner.endpoints[cursor].url.clone();
            info!(
                "[rpc_pool] Active endpoint {} is slow ({}ms avg); switching to {} ({:?}ms avg)",
                from_url, current_avg, to_url, to_avg
            );
            inner.cursor = idx;
            self.failover_events.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings(urls: &[&str]) -> Settings {
        let mut settings = Settings::default();
        settings.rpc.http_urls = urls.iter().map(|s| s.to_string()).collect();
        settings.rpc.max_response_time_ms = 500;
        settings
    }

    fn pool(urls: &[&str]) -> RpcEndpointPool {
        RpcEndpointPool::new(&test_settings(urls)).unwrap()
    }

    #[test]
    fn zero_endpoints_is_fatal() {
        let err = RpcEndpointPool::new(&test_settings(&[])).unwrap_err();
        assert!(matches!(err, PoolError::NoEndpoints));
    }

    #[tokio::test]
    async fn failover_uses_next_endpoint_in_order() {
        let pool = pool(&["http://127.0.0.1:18545", "http://127.0.0.1:18546"]);

        let winner = pool
            .execute_with_failover("probe", |_provider, url| async move {
                if url.contains("18545") {
                    anyhow::bail!("primary down")
                }
                Ok(url)
            })
            .await
            .unwrap();

        assert!(winner.contains("18546"));
        let stats = pool.stats();
        assert_eq!(stats.failover_events, 1);
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.total_failures, 1);
    }

    #[tokio::test]
    async fn cursor_is_sticky_after_failover() {
        let pool = pool(&["http://127.0.0.1:18545", "http://127.0.0.1:18546"]);

        for _ in 0..2 {
            pool.execute_with_failover("probe", |_provider, url| async move {
                if url.contains("18545") {
                    anyhow::bail!("primary down")
                }
                Ok(())
            })
            .await
            .unwrap();
        }

        // Second call started from the moved cursor, so only one failover total.
        assert_eq!(pool.stats().failover_events, 1);
    }

    #[tokio::test]
    async fn endpoint_demoted_after_threshold_failures() {
        let pool = pool(&["http://127.0.0.1:18545"]);

        for _ in 0..4 {
            let _ = pool
                .execute_with_failover::<(), _, _>("probe", |_provider, _url| async move {
                    anyhow::bail!("down")
                })
                .await
                .unwrap_err();
        }

        let stats = pool.stats();
        assert!(!stats.endpoints[0].healthy);
        assert_eq!(stats.endpoints[0].consecutive_failures, 4);

        // Demoted endpoint is excluded from selection entirely.
        let err = pool
            .execute_with_failover("probe", |_provider, _url| async move { Ok(()) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exhausted"));
    }

    #[tokio::test]
    async fn exhaustion_error_carries_last_failure() {
        let pool = pool(&["http://127.0.0.1:18545", "http://127.0.0.1:18546"]);

        let err = pool
            .execute_with_failover("fetch_reserves", |_provider, url| async move {
                anyhow::bail!("refused by {}", url);
                #[allow(unreachable_code)]
                Ok(())
            })
            .await
            .unwrap_err();

        let msg = err.to_string();
        assert!(msg.contains("fetch_reserves"));
        assert!(msg.contains("refused by"));
        assert_eq!(pool.stats().total_failures, 2);
    }

    #[tokio::test]
    async fn each_endpoint_tried_at_most_once_per_call() {
        let pool = pool(&["http://127.0.0.1:18545", "http://127.0.0.1:18546"]);
        let calls = Arc::new(Mutex::new(Vec::new()));

        let calls_clone = calls.clone();
        let _ = pool
            .execute_with_failover("probe", move |_provider, url| {
                let calls = calls_clone.clone();
                async move {
                    calls.lock().unwrap().push(url);
                    anyhow::bail!("down");
                    #[allow(unreachable_code)]
                    Ok(())
                }
            })
            .await
            .unwrap_err();

        let seen = calls.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_ne!(seen[0], seen[1]);
    }

    #[tokio::test]
    async fn health_probe_repromotes_demoted_endpoints() {
        let pool = pool(&["http://127.0.0.1:18545", "http://127.0.0.1:18546"]);

        // Drive both endpoints past the failure threshold.
        for _ in 0..4 {
            let _ = pool
                .execute_with_failover("probe", |_provider, _url| async move {
                    anyhow::bail!("down");
                    #[allow(unreachable_code)]
                    Ok(())
                })
                .await
                .unwrap_err();
        }
        let stats = pool.stats();
        assert!(stats.endpoints.iter().all(|e| !e.healthy));

        // With everything demoted, calls exhaust immediately.
        let err = pool
            .execute_with_failover("probe", |_provider, _url| async move { Ok(()) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exhausted"));

        // A successful probe round restores health and resets the counters.
        pool.run_health_pass_with(|_provider, _url| async move { Ok(()) })
            .await;

        let stats = pool.stats();
        assert!(stats.endpoints.iter().all(|e| e.healthy));
        assert!(stats.endpoints.iter().all(|e| e.consecutive_failures == 0));

        // Re-promoted endpoints are selectable again.
        pool.execute_with_failover("probe", |_provider, _url| async move { Ok(()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn health_pass_moves_cursor_off_slow_endpoint() {
        let mut settings = test_settings(&["http://127.0.0.1:18545", "http://127.0.0.1:18546"]);
        settings.rpc.health_check.slow_endpoint_threshold_ms = 10;
        let pool = RpcEndpointPool::new(&settings).unwrap();

        // First endpoint probes slow, second fast.
        pool.run_health_pass_with(|_provider, url| async move {
            if url.contains("18545") {
                sleep(Duration::from_millis(50)).await;
            }
            Ok(())
        })
        .await;

        assert_eq!(pool.stats().failover_events, 1);
        let winner = pool
            .execute_with_failover("probe", |_provider, url| async move { Ok(url) })
            .await
            .unwrap();
        assert!(winner.contains("18546"));
    }

    #[tokio::test]
    async fn slow_call_times_out_and_fails_over() {
        let mut settings = test_settings(&["http://127.0.0.1:18545", "http://127.0.0.1:18546"]);
        settings.rpc.max_response_time_ms = 20;
        let pool = RpcEndpointPool::new(&settings).unwrap();

        let winner = pool
            .execute_with_failover("probe", |_provider, url| async move {
                if url.contains("18545") {
                    sleep(Duration::from_millis(200)).await;
                }
                Ok(url)
            })
            .await
            .unwrap();

        assert!(winner.contains("18546"));
        assert_eq!(pool.stats().total_failures, 1);
    }
}
