use crate::channels::ProviderError;
use crate::config::ProviderConfig;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

const MAX_BACKOFF_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_ms: u64,
}

impl From<&ProviderConfig> for RetryPolicy {
    fn from(cfg: &ProviderConfig) -> Self {
        Self {
            attempts: cfg.retry_attempts.max(1),
            base_ms: cfg.retry_base_ms,
        }
    }
}

pub fn compute_backoff(attempt: u32, base_ms: u64) -> Duration {
    let exponent = attempt.max(1).saturating_sub(1).min(16);
    let delay = base_ms.saturating_mul(1_u64 << exponent);
    Duration::from_millis(delay.min(MAX_BACKOFF_MS))
}

/// Runs `op` until it succeeds, fails with a rejection, or runs out of attempts.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.attempts => {
                let delay = compute_backoff(attempt, policy.base_ms);
                let delay_ms = delay.as_millis() as u64;
                warn!(attempt, delay_ms, "{what} failed, retrying: {err}");
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
