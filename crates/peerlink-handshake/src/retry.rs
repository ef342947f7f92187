//! Exponential backoff around a fallible async action.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Retry schedule: `min(base_delay * 2^n, max_delay)` before retry `n + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt + 1` (zero-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Run `action`, retrying failures that `should_retry` accepts.
    ///
    /// Before each retry the policy sleeps, then awaits `on_retry(attempt)`
    /// (1-based) to repair whatever broke. A failing `on_retry` counts as a
    /// failed attempt. Once retries are exhausted the last error is returned.
    pub async fn execute<T, E, A, AF, R, RF, S>(
        &self,
        mut action: A,
        mut on_retry: R,
        should_retry: S,
    ) -> Result<T, E>
    where
        A: FnMut() -> AF,
        AF: Future<Output = Result<T, E>>,
        R: FnMut(u32) -> RF,
        RF: Future<Output = Result<(), E>>,
        S: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 0;
        let mut result = action().await;
        loop {
            let error = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if !should_retry(&error) {
                return Err(error);
            }
            if attempt >= self.max_retries {
                tracing::warn!(attempts = attempt + 1, error = %error, "retries exhausted");
                return Err(error);
            }

            let delay = self.delay_for_attempt(attempt);
            attempt += 1;
            tracing::debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying after failure"
            );
            tokio::time::sleep(delay).await;

            result = match on_retry(attempt).await {
                Ok(()) => action().await,
                Err(e) => Err(e),
            };
        }
    }
}
