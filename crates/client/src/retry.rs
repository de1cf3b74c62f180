//! Exponential-backoff retry around remote operations.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::transport::ClientError;

/// Backoff policy for transient failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
    /// Total attempts before giving up; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_attempts: Some(10),
        }
    }
}

impl RetryConfig {
    /// Calculates the delay after a given attempt number (1-based),
    /// with ±25% jitter to avoid thundering herd.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        let jitter = capped * 0.25;
        let offset = (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as f64
            / u32::MAX as f64)
            * 2.0
            - 1.0; // [-1.0, 1.0)
        let with_jitter = (capped + jitter * offset).max(0.001);
        Duration::from_secs_f64(with_jitter)
    }
}

/// Runs `op` until it succeeds, fails fatally, or exhausts the attempt
/// budget.
///
/// A fatal classification ([`ClientError::is_fatal`]) short-circuits
/// immediately; transient failures sleep for the backoff delay and try
/// again.
pub async fn retry<T, F, Fut>(
    config: &RetryConfig,
    operation: &'static str,
    mut op: F,
) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_fatal() => {
                warn!(op = operation, "authorization rejected, not retrying");
                return Err(err);
            }
            Err(err) => {
                if let Some(max) = config.max_attempts
                    && attempt >= max
                {
                    warn!(op = operation, attempts = attempt, "retries exhausted");
                    return Err(err);
                }
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    op = operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
