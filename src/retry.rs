// Retry helper - bounded exponential backoff with jitter for fallible network calls.
// Used by the explorer client and startup probes; the RPC pool and the provider
// cascades have their own failover logic and do not go through here.

use anyhow::Result;
use log::warn;
use std::future::Future;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

/// Default base delay between attempts. Delays grow as powers of the base,
/// capped by `MAX_DELAY`.
pub const DEFAULT_BASE_DELAY_MS: u64 = 50;

const MAX_DELAY: Duration = Duration::from_secs(10);

/// Runs `op` up to `max_retries + 1` times with exponential backoff and jitter.
///
/// The last error is returned verbatim once the attempt budget is exhausted;
/// intermediate failures are logged at `warn` level under `label`.
pub async fn with_backoff<T, F, Fut>(
    label: &str,
    max_retries: usize,
    base_delay: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let strategy = ExponentialBackoff::from_millis(base_delay.as_millis() as u64)
        .max_delay(MAX_DELAY)
        .map(jitter)
        .take(max_retries);

    let mut attempt = 0usize;
    Retry::spawn(strategy, || {
        attempt += 1;
        let fut = op();
        let label = label.to_string();
        let this_attempt = attempt;
        async move {
            match fut.await {
                Ok(v) => Ok(v),
                Err(e) => {
                    warn!(
                        "[retry] {} attempt {} failed: {}",
                        label, this_attempt, e
                    );
                    Err(e)
                }
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result = with_backoff("test_op", 3, Duration::from_millis(1), move || {
            let calls = calls_clone.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("transient")
                }
                Ok(42u32)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result: Result<()> = with_backoff("always_fails", 2, Duration::from_millis(1), move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("permanent")
            }
        })
        .await;

        assert!(result.is_err());
        // initial attempt + 2 retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
