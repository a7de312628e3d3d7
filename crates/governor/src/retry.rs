//! Bounded per-item retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

use tipoff_core::RetryConfig;

use crate::client::FetchError;
use crate::error::GovernorError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_backoff: Duration,
    backoff_factor: f64,
    max_backoff: Duration,
}

/// Cap applied when a policy is built without one.
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff,
            backoff_factor: backoff_factor.max(1.0),
            max_backoff: DEFAULT_MAX_BACKOFF.max(base_backoff),
        }
    }

    /// Clamp every wait to `max_backoff`.
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_backoff_ms),
            config.backoff_factor,
        )
        .with_max_backoff(Duration::from_millis(config.max_backoff_ms))
    }

    /// A single attempt, no retry.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, 1.0)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait before attempt `attempt + 1`, given that `attempt` (1-based) failed.
    /// Saturates at the policy's max backoff.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.base_backoff.as_secs_f64() * self.backoff_factor.powi(exp);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails terminally or the attempt budget runs
    /// out. `op` receives the 1-based attempt number.
    ///
    /// Only retryable fetch errors are retried. A `Retry-After` hint longer
    /// than the computed backoff wins.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, GovernorError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, GovernorError>>,
    {
        let mut attempt = 1;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let fetch_err = match &err {
                GovernorError::Fetch(e) if e.is_retryable() => e.clone(),
                _ => return Err(err),
            };

            if attempt >= self.max_attempts {
                error!(item = label, attempts = attempt, error = %fetch_err, "retries exhausted");
                return Err(GovernorError::Exhausted {
                    attempts: attempt,
                    last: fetch_err,
                });
            }

            let mut wait = self.backoff_after(attempt);
            if let FetchError::RateLimited {
                retry_after: Some(hint),
            } = &fetch_err
            {
                wait = wait.max(*hint);
            }
            warn!(
                item = label,
                attempt,
                max_attempts = self.max_attempts,
                wait_ms = wait.as_millis() as u64,
                error = %fetch_err,
                "retrying"
            );
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }
}
