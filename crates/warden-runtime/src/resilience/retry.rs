//! Retry with exponential backoff on the same provider.

use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::duration_str;
use crate::error::AnalysisError;

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per provider, including the first
    pub max_attempts: usize,

    #[serde(with = "duration_str")]
    pub initial_delay: Duration,

    #[serde(with = "duration_str")]
    pub max_delay: Duration,

    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub(crate) fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.max_attempts == 0 {
            problems.push("retry.max_attempts must be positive".to_string());
        }
        if self.max_delay < self.initial_delay {
            problems.push("retry.max_delay is shorter than retry.initial_delay".to_string());
        }
        problems
    }
}

/// Retries retryable errors (rate limits, timeouts, transport failures).
///
/// Everything else returns immediately: a `CircuitOpen` from a breaker
/// inside the attempt ends the loop, and validation failures are left for
/// failover to a different provider.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    fn backoff(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.config.initial_delay)
            .with_max_delay(self.config.max_delay)
            .with_max_times(self.config.max_attempts.saturating_sub(1));
        if self.config.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }

    pub async fn run<T, F, Fut>(&self, provider: &str, attempt: F) -> Result<T, AnalysisError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AnalysisError>>,
    {
        attempt
            .retry(self.backoff())
            .when(AnalysisError::is_retryable)
            .adjust(|err, delay| match err {
                // The provider's hint is a floor, never a reason to give up
                AnalysisError::RateLimited {
                    retry_after: Some(hint),
                    ..
                } => delay.map(|d| d.max(*hint)),
                _ => delay,
            })
            .notify(|err, delay| {
                warn!(
                    provider = %provider,
                    error = %err,
                    delay = ?delay,
                    "Retrying provider call"
                );
            })
            .await
    }
}
