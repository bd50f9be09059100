//! Jittered exponential backoff.

use crate::error::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Upper bound of the random delay added to each wait
    pub jitter: Duration,
}

impl RetryConfig {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: Duration::from_millis(100),
        }
    }

    /// A single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before `attempt` (0-indexed). The first attempt never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_delay.as_secs_f64()
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32);
        let capped = Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()));

        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return capped;
        }
        capped + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(10)
    }
}

/// Run `op` until it succeeds, fails with a non-transient error or attempts
/// run out. Only [`Error::is_retryable`](crate::Error::is_retryable) failures
/// are attempted again.
///
/// `op` receives the 0-indexed attempt number.
pub async fn jittered_retry<F, Fut, T>(config: &RetryConfig, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        let delay = config.delay_for_attempt(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => {
                tracing::warn!(attempt, error = %err, "sync error is not retryable");
                return Err(err);
            }
            Err(err) if attempt + 1 >= config.max_attempts.max(1) => {
                tracing::warn!(attempt, error = %err, "retries exhausted");
                return Err(err);
            }
            Err(err) => {
                tracing::debug!(attempt, error = %err, "retrying sync request");
                attempt += 1;
            }
        }
    }
}
