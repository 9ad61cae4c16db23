// Provider cascade - ordered list of upstream data sources with per-source
// rate gates and first-success-wins semantics. Shared by the price oracle and
// the volume analyzer so the retry/rate-limit control flow exists exactly once.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Minimum-interval gate: a call is eligible only if at least `min_interval`
/// elapsed since the previous one. Not a token bucket; there is no queue.
pub struct RateGate {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    /// Non-blocking check: passes and stamps the gate if eligible, otherwise
    /// returns false without waiting.
    pub fn try_pass(&self) -> bool {
        let mut last = self.last_call.lock().unwrap();
        let now = Instant::now();
        match *last {
            Some(prev) if now.duration_since(prev) < self.min_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Blocking variant: sleeps until the gate is eligible, then stamps it.
    pub async fn wait(&self) {
        let remaining = {
            let last = self.last_call.lock().unwrap();
            match *last {
                Some(prev) => self.min_interval.checked_sub(prev.elapsed()),
                None => None,
            }
        };
        if let Some(remaining) = remaining {
            sleep(remaining).await;
        }
        let mut last = self.last_call.lock().unwrap();
        *last = Some(Instant::now());
    }
}

/// What to do when a source's gate has not cleared yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePolicy {
    /// Treat the gated call as a synthetic failure and move to the next source
    /// immediately (price oracle: degrade fast, never wait on the alert path).
    SkipWhenLimited,
    /// Sleep until the gate clears before calling (volume analyzer: tolerate
    /// latency, volume is a secondary signal).
    WaitWhenLimited,
}

/// One upstream data source in a cascade.
#[async_trait]
pub trait CascadeSource<I, O>: Send + Sync
where
    I: Sync,
{
    fn name(&self) -> &'static str;
    fn gate(&self) -> &RateGate;
    async fn fetch(&self, input: &I) -> Result<O>;
}

/// Tries each source in order and returns the first usable result together
/// with the winning source's name. The error carries the last underlying
/// failure once every source has been tried or skipped.
pub async fn first_success<I, O>(
    sources: &[std::sync::Arc<dyn CascadeSource<I, O>>],
    input: &I,
    policy: GatePolicy,
) -> Result<(O, &'static str)>
where
    I: Sync,
{
    let mut last_err = anyhow!("no sources configured");

    for source in sources {
        match policy {
            GatePolicy::SkipWhenLimited => {
                if !source.gate().try_pass() {
                    debug!("[cascade] {} rate gated, skipping", source.name());
                    last_err = anyhow!("{} rate limited", source.name());
                    continue;
                }
            }
            GatePolicy::WaitWhenLimited => source.gate().wait().await,
        }

        match source.fetch(input).await {
            Ok(value) => return Ok((value, source.name())),
            Err(e) => {
                warn!("[cascade] {} failed: {}", source.name(), e);
                last_err = e;
            }
        }
    }

    Err(last_err)
}
