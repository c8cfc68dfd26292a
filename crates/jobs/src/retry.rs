//! Retrying store calls through transient outages.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use taskmill_core::{Backoff, QueueResult};

/// How hard the queue manager tries before surfacing `StoreUnavailable`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreRetry {
    /// Retries after the first failure; 0 disables retrying
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Each delay is scaled by a random factor in `[1 - jitter, 1 + jitter]`
    pub jitter: f64,
}

impl Default for StoreRetry {
    fn default() -> Self {
        Self {
            max_retries: 4,
            backoff: Backoff::new(Duration::from_millis(100), Duration::from_secs(5)),
            jitter: 0.5,
        }
    }
}

impl StoreRetry {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Run `op`, retrying transient (`StoreUnavailable`) failures with jittered
/// exponential backoff. Other errors, and the last transient one, are returned
/// as-is.
pub async fn with_store_retry<T, F, Fut>(
    policy: &StoreRetry,
    operation: &'static str,
    mut op: F,
) -> QueueResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = QueueResult<T>>,
{
    let mut retries = 0;
    loop {
        match op().await {
            Err(err) if err.is_transient() && retries < policy.max_retries => {
                let delay = jittered(policy.backoff.delay(retries), policy.jitter);
                retries += 1;
                warn!(
                    operation,
                    retry = retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "store unavailable, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            result => return result,
        }
    }
}

/// Scale `delay` by a uniform random factor in `[1 - jitter, 1 + jitter]`.
pub(crate) fn jittered(delay: Duration, jitter: f64) -> Duration {
    let jitter = jitter.clamp(0.0, 1.0);
    if jitter == 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = 1.0 - jitter + fastrand::f64() * 2.0 * jitter;
    delay.mul_f64(factor)
}
