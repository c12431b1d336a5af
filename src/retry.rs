use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use crate::error::LedgerError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self { max_attempts: max_attempts.max(1), base_delay }
    }

    /// Exponential backoff with up to 100% jitter.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64);
        base + Duration::from_millis(jitter_ms)
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error, or
    /// the attempts run out. The last error is returned.
    pub async fn run<F, Fut, T>(&self, operation_name: &str, mut operation: F) -> Result<T, LedgerError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let mut attempt = 0;
        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(operation = operation_name, attempt = attempt + 1, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100))
    }
}
