use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::ProviderError;

/// Bounded retry for provider calls.
///
/// `Unavailable` is retried with jittered exponential backoff until
/// `max_attempts` calls have been made. `RateLimited` gets exactly one more
/// call, after the provider's `Retry-After` (capped at `max_delay`) when it
/// sent one. Anything else (timeouts included) is returned at once.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms)),
        }
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 1u32;
        let mut rate_limit_retried = false;

        loop {
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let delay = match &err {
                ProviderError::Unavailable(_) if attempt < self.max_attempts => {
                    self.backoff(attempt)
                }
                ProviderError::RateLimited { retry_after } if !rate_limit_retried => {
                    rate_limit_retried = true;
                    retry_after
                        .map(|wait| wait.min(self.max_delay))
                        .unwrap_or_else(|| self.backoff(attempt))
                }
                _ => return Err(err),
            };

            tracing::warn!(
                "{} failed (attempt {}): {}; retrying in {:?}",
                operation,
                attempt,
                err,
                delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.max_delay);
        if capped.is_zero() {
            return capped;
        }
        let jitter = rand::rng().random_range(0.5..=1.0);
        capped.mul_f64(jitter)
    }
}
