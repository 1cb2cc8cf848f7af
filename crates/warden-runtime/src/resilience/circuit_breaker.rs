//! Circuit breaker to prevent cascade failures.
//!
//! When a provider fails repeatedly, its circuit opens and calls fail fast
//! with [`AnalysisError::CircuitOpen`] until the cooldown elapses. The next
//! caller then moves the circuit to half-open and tries the provider again.
//!
//! Circuit records live in the shared [`StateStore`], one JSON value per
//! provider, and every transition is a compare-and-swap so concurrent
//! callers (in this process or another) agree on the state.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::clock::{duration_ms, Clock};
use crate::config::duration_str;
use crate::error::AnalysisError;
use crate::store::{encode_json, keys, StateStore, StoreError};

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening circuit
    pub failure_threshold: u32,

    /// Time before a half-open trial call is allowed
    #[serde(with = "duration_str")]
    pub cooldown: Duration,

    /// Half-open successes needed to close circuit
    pub success_threshold: u32,

    /// Per-call timeout; a timeout counts as a failure
    #[serde(with = "duration_str")]
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            success_threshold: 2,
            timeout: Duration::from_secs(10),
        }
    }
}

impl CircuitBreakerConfig {
    pub(crate) fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.failure_threshold == 0 {
            problems.push("circuit_breaker.failure_threshold must be positive".to_string());
        }
        if self.success_threshold == 0 {
            problems.push("circuit_breaker.success_threshold must be positive".to_string());
        }
        if self.timeout.is_zero() {
            problems.push("circuit_breaker.timeout must be positive".to_string());
        }
        problems
    }
}

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// Calls fail fast
    Open,

    /// Testing if circuit can close
    HalfOpen,
}

/// The stored per-provider record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitRecord {
    pub state: CircuitState,
    /// Consecutive failures
    pub failures: u32,
    pub half_open_successes: u32,
    /// Meaningful only while open
    pub open_until_ms: i64,
}

impl Default for CircuitRecord {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            half_open_successes: 0,
            open_until_ms: 0,
        }
    }
}

// Bound on CAS retries under contention
const MAX_CAS_ATTEMPTS: usize = 16;

/// Per-provider circuit breaker over a shared store.
pub struct CircuitBreaker {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` through the circuit for `provider`.
    ///
    /// Fails fast with `CircuitOpen` while the circuit is open. Otherwise
    /// the operation runs under the configured timeout and its outcome is
    /// recorded. Errors that are not provider failures (budget, store) pass
    /// through without touching the circuit.
    pub async fn execute<T, F, Fut>(&self, provider: &str, operation: F) -> Result<T, AnalysisError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AnalysisError>>,
    {
        self.admit(provider).await?;

        let result = match tokio::time::timeout(self.config.timeout, operation()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(provider = %provider, timeout = ?self.config.timeout, "Provider call timed out");
                Err(AnalysisError::Timeout {
                    provider: provider.to_string(),
                    after: self.config.timeout,
                })
            }
        };

        match &result {
            Ok(_) => self.record_success(provider).await,
            Err(e) if e.is_provider_failure() => self.record_failure(provider).await,
            Err(_) => {}
        }
        result
    }

    /// Current state; a missing record is CLOSED.
    pub async fn state(&self, provider: &str) -> CircuitState {
        self.record(provider).await.state
    }

    /// The stored record, or the default when absent or unreadable.
    pub async fn record(&self, provider: &str) -> CircuitRecord {
        match self.load(provider).await {
            Ok((_, record)) => record,
            Err(e) => {
                warn!(provider = %provider, error = %e, "Circuit state unreadable, assuming closed");
                CircuitRecord::default()
            }
        }
    }

    /// Open with cooldown still running. Read-only.
    pub async fn is_open(&self, provider: &str) -> bool {
        let record = self.record(provider).await;
        record.state == CircuitState::Open && self.clock.now_ms() < record.open_until_ms
    }

    /// Forget the circuit, closing it.
    pub async fn reset(&self, provider: &str) -> Result<(), StoreError> {
        self.store.delete(&keys::circuit(provider)).await
    }

    pub async fn record_success(&self, provider: &str) {
        let success_threshold = self.config.success_threshold;
        self.transition(provider, |current, _now| match current.state {
            CircuitState::Closed => CircuitRecord {
                failures: 0,
                ..current.clone()
            },
            CircuitState::HalfOpen if current.half_open_successes + 1 >= success_threshold => {
                CircuitRecord::default()
            }
            CircuitState::HalfOpen => CircuitRecord {
                half_open_successes: current.half_open_successes + 1,
                ..current.clone()
            },
            // A call admitted before the circuit opened
            CircuitState::Open => current.clone(),
        })
        .await;
    }

    pub async fn record_failure(&self, provider: &str) {
        let threshold = self.config.failure_threshold;
        let cooldown = duration_ms(self.config.cooldown);
        self.transition(provider, |current, now| match current.state {
            CircuitState::Closed if current.failures + 1 >= threshold => CircuitRecord {
                state: CircuitState::Open,
                failures: current.failures + 1,
                half_open_successes: 0,
                open_until_ms: now.saturating_add(cooldown),
            },
            CircuitState::Closed => CircuitRecord {
                failures: current.failures + 1,
                ..current.clone()
            },
            CircuitState::HalfOpen => CircuitRecord {
                state: CircuitState::Open,
                failures: current.failures + 1,
                half_open_successes: 0,
                open_until_ms: now.saturating_add(cooldown),
            },
            CircuitState::Open => current.clone(),
        })
        .await;
    }

    /// Fail fast while open; move an expired open circuit to half-open.
    async fn admit(&self, provider: &str) -> Result<(), AnalysisError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (raw, record) = match self.load(provider).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!(provider = %provider, error = %e, "Circuit state unreadable, failing open");
                    return Ok(());
                }
            };

            if record.state != CircuitState::Open {
                return Ok(());
            }
            if self.clock.now_ms() < record.open_until_ms {
                return Err(AnalysisError::CircuitOpen {
                    provider: provider.to_string(),
                });
            }

            let next = CircuitRecord {
                state: CircuitState::HalfOpen,
                half_open_successes: 0,
                ..record
            };
            match self.swap(provider, raw.as_deref(), &next).await {
                Ok(true) => {
                    info!(provider = %provider, "Circuit half-open, probing provider");
                    return Ok(());
                }
                Ok(false) => continue,
                Err(e) => {
                    warn!(provider = %provider, error = %e, "Circuit transition failed, failing open");
                    return Ok(());
                }
            }
        }
        // Lost every race; another caller is moving the circuit
        Ok(())
    }

    async fn transition<F>(&self, provider: &str, next_of: F)
    where
        F: Fn(&CircuitRecord, i64) -> CircuitRecord,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (raw, current) = match self.load(provider).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!(provider = %provider, error = %e, "Failed to read circuit state");
                    return;
                }
            };
            let next = next_of(&current, self.clock.now_ms());
            if next == current {
                return;
            }
            match self.swap(provider, raw.as_deref(), &next).await {
                Ok(true) => {
                    log_transition(provider, &current, &next);
                    return;
                }
                Ok(false) => continue,
                Err(e) => {
                    warn!(provider = %provider, error = %e, "Failed to write circuit state");
                    return;
                }
            }
        }
        warn!(provider = %provider, "Circuit update abandoned under contention");
    }

    /// Raw stored value (for CAS) and the decoded record. A corrupt value
    /// decodes as the default and is overwritten by the next transition.
    async fn load(&self, provider: &str) -> Result<(Option<String>, CircuitRecord), StoreError> {
        let raw = self.store.get(&keys::circuit(provider)).await?;
        let record = raw
            .as_deref()
            .and_then(|r| serde_json::from_str(r).ok())
            .unwrap_or_default();
        Ok((raw, record))
    }

    async fn swap(
        &self,
        provider: &str,
        expected: Option<&str>,
        next: &CircuitRecord,
    ) -> Result<bool, StoreError> {
        let key = keys::circuit(provider);
        let encoded = encode_json(&key, next)?;
        self.store
            .compare_and_swap(&key, expected, encoded, None)
            .await
    }
}

fn log_transition(provider: &str, from: &CircuitRecord, to: &CircuitRecord) {
    match (from.state, to.state) {
        (CircuitState::Closed, CircuitState::Open) => warn!(
            provider = %provider,
            failures = to.failures,
            "Circuit opened after repeated failures"
        ),
        (CircuitState::HalfOpen, CircuitState::Open) => {
            warn!(provider = %provider, "Circuit reopened after failed recovery attempt")
        }
        (CircuitState::HalfOpen, CircuitState::Closed) => {
            info!(provider = %provider, "Circuit closed after successful recovery")
        }
        _ => {}
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .finish()
    }
}
