//! Submission retry with exponential backoff
//!
//! Only scheduling conflicts are retried; every other failure is final.

use crate::config::millis;
use crate::error::{SchedulerError, SchedulerResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Retry policy for graph submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub max_attempts: usize,

    /// Backoff before the second attempt
    #[serde(rename = "initial_backoff_ms", with = "millis")]
    pub initial_backoff: Duration,

    /// Upper bound for any single backoff
    #[serde(rename = "max_backoff_ms", with = "millis")]
    pub max_backoff: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential backoff)
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// No retries (fail fast)
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn should_retry(&self, error: &SchedulerError) -> bool {
        error.is_conflict()
    }

    /// Backoff before attempt number `attempt` (0-indexed)
    pub fn backoff_duration(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_millis = self.initial_backoff.as_millis() as f64;
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let backoff_millis = base_millis * self.backoff_multiplier.powi(exponent);

        if !backoff_millis.is_finite() || backoff_millis >= self.max_backoff.as_millis() as f64 {
            self.max_backoff
        } else {
            Duration::from_millis(backoff_millis as u64)
        }
    }
}

/// Run `submit` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up.
pub async fn submit_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    correlation_id: &str,
    mut submit: F,
) -> SchedulerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SchedulerResult<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if attempt > 0 {
            let backoff = policy.backoff_duration(attempt);
            tracing::warn!(
                "Submission of graph '{}' conflicted, retrying in {:?} (attempt {}/{})",
                correlation_id,
                backoff,
                attempt + 1,
                attempts
            );
            tokio::time::sleep(backoff).await;
        }

        match submit().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(
                        "Graph '{}' submitted on attempt {}/{}",
                        correlation_id,
                        attempt + 1,
                        attempts
                    );
                }
                return Ok(value);
            }
            Err(error) if policy.should_retry(&error) && attempt + 1 < attempts => {
                tracing::debug!(
                    "Graph '{}' attempt {}/{} failed: {}",
                    correlation_id,
                    attempt + 1,
                    attempts,
                    error
                );
            }
            Err(error) => {
                tracing::error!(
                    "Submission of graph '{}' failed after {} attempt(s): {}",
                    correlation_id,
                    attempt + 1,
                    error
                );
                return Err(error);
            }
        }
        attempt += 1;
    }
}
