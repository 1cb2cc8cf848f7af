//! Request coalescing.
//!
//! At most one judgment call is in flight per cache key. The first caller
//! takes a lock in the shared store; later callers poll the result cache
//! until the holder's result appears, the lock disappears, or they give up.
//! Locks expire on their own so a crashed holder cannot wedge a key.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::{CacheKey, DifferentialCache};
use crate::clock::{duration_ms, Clock};
use crate::config::duration_str;
use crate::orchestrator::AnalysisResult;
use crate::store::{encode_json, get_json, keys, StateStore};

/// Coalescing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoalescingConfig {
    /// Lock lifetime, independent of release
    #[serde(with = "duration_str")]
    pub lock_ttl: Duration,

    /// How long a waiter polls before giving up
    #[serde(with = "duration_str")]
    pub max_wait: Duration,

    #[serde(with = "duration_str")]
    pub poll_initial: Duration,

    pub poll_factor: f64,

    #[serde(with = "duration_str")]
    pub poll_max: Duration,
}

impl Default for CoalescingConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            max_wait: Duration::from_secs(30),
            poll_initial: Duration::from_millis(500),
            poll_factor: 1.5,
            poll_max: Duration::from_secs(1),
        }
    }
}

impl CoalescingConfig {
    pub(crate) fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.lock_ttl.is_zero() {
            problems.push("coalescing.lock_ttl must be positive".to_string());
        }
        if self.poll_initial.is_zero() {
            problems.push("coalescing.poll_initial must be positive".to_string());
        }
        if self.poll_factor.is_nan() || self.poll_factor < 1.0 {
            problems.push("coalescing.poll_factor must be at least 1.0".to_string());
        }
        if self.poll_max < self.poll_initial {
            problems.push("coalescing.poll_max is shorter than coalescing.poll_initial".to_string());
        }
        problems
    }
}

/// The stored lock record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InFlightLock {
    pub holder: String,
    pub started_at_ms: i64,
    pub expires_at_ms: i64,
}

/// Result of trying to take the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    /// This caller holds the lock
    Acquired,
    /// The store was unreachable; proceed without a lock
    Unguarded,
    /// Another caller holds it
    Held,
}

impl LockStatus {
    /// Whether this caller should make the call itself.
    pub fn proceed(self) -> bool {
        !matches!(self, LockStatus::Held)
    }
}

/// What a waiter saw.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Ready(AnalysisResult),
    /// The holder finished without caching a result
    Released,
    TimedOut,
}

/// Coalesces concurrent analyses of the same key.
pub struct RequestCoalescer {
    store: Arc<dyn StateStore>,
    cache: Arc<DifferentialCache>,
    clock: Arc<dyn Clock>,
    config: CoalescingConfig,
}

impl RequestCoalescer {
    pub fn new(
        store: Arc<dyn StateStore>,
        cache: Arc<DifferentialCache>,
        clock: Arc<dyn Clock>,
        config: CoalescingConfig,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &CoalescingConfig {
        &self.config
    }

    /// Atomically create the lock for `key`. A store failure fails open.
    pub async fn acquire_lock(&self, key: &CacheKey, correlation_id: &str) -> LockStatus {
        let lock_key = keys::lock(key.as_str());
        let now = self.clock.now_ms();
        let record = InFlightLock {
            holder: correlation_id.to_string(),
            started_at_ms: now,
            expires_at_ms: now.saturating_add(duration_ms(self.config.lock_ttl)),
        };
        let value = match encode_json(&lock_key, &record) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to encode lock, proceeding unguarded");
                return LockStatus::Unguarded;
            }
        };

        match self
            .store
            .set_if_absent(&lock_key, value, Some(self.config.lock_ttl))
            .await
        {
            Ok(true) => LockStatus::Acquired,
            Ok(false) => {
                debug!(key = %key, correlation_id = %correlation_id, "Analysis already in flight");
                LockStatus::Held
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Lock store unavailable, proceeding unguarded");
                LockStatus::Unguarded
            }
        }
    }

    /// Delete the lock if `correlation_id` still holds it.
    pub async fn release_lock(&self, key: &CacheKey, correlation_id: &str) {
        let lock_key = keys::lock(key.as_str());
        match get_json::<InFlightLock>(self.store.as_ref(), &lock_key).await {
            // Expired and re-taken by someone else
            Ok(Some(Ok(lock))) if lock.holder != correlation_id => {}
            Ok(None) => {}
            Ok(Some(_)) => {
                if let Err(e) = self.store.delete(&lock_key).await {
                    warn!(key = %key, error = %e, "Failed to release lock");
                }
            }
            Err(e) => warn!(key = %key, error = %e, "Failed to release lock"),
        }
    }

    /// Push the lock's expiry out by a full `lock_ttl`. False when
    /// `correlation_id` no longer holds it.
    pub async fn extend_lock(&self, key: &CacheKey, correlation_id: &str) -> bool {
        let lock_key = keys::lock(key.as_str());
        let raw = match self.store.get(&lock_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return false,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read lock for renewal");
                return false;
            }
        };
        let lock = match serde_json::from_str::<InFlightLock>(&raw) {
            Ok(lock) if lock.holder == correlation_id => lock,
            _ => return false,
        };
        let renewed = InFlightLock {
            expires_at_ms: self
                .clock
                .now_ms()
                .saturating_add(duration_ms(self.config.lock_ttl)),
            ..lock
        };
        let Ok(value) = encode_json(&lock_key, &renewed) else {
            return false;
        };
        match self
            .store
            .compare_and_swap(&lock_key, Some(&raw), value, Some(self.config.lock_ttl))
            .await
        {
            Ok(swapped) => swapped,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to renew lock");
                false
            }
        }
    }

    /// Drive `work` to completion, renewing the lock every third of its
    /// TTL so it cannot lapse while the holder is still calling providers.
    pub async fn hold_while<F: Future>(
        &self,
        key: &CacheKey,
        correlation_id: &str,
        work: F,
    ) -> F::Output {
        let every = (self.config.lock_ttl / 3).max(Duration::from_millis(1));
        let mut renewing = true;
        tokio::pin!(work);
        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = tokio::time::sleep(every), if renewing => {
                    if !self.extend_lock(key, correlation_id).await {
                        warn!(
                            key = %key,
                            correlation_id = %correlation_id,
                            "Lost coalescing lock while analysis is in flight"
                        );
                        renewing = false;
                    }
                }
            }
        }
    }

    /// The current holder, if any.
    pub async fn holder(&self, key: &CacheKey) -> Option<InFlightLock> {
        match get_json::<InFlightLock>(self.store.as_ref(), &keys::lock(key.as_str())).await {
            Ok(Some(Ok(lock))) => Some(lock),
            _ => None,
        }
    }

    /// Poll the cache with backoff until a result appears, the lock goes
    /// away without one, or `max_wait` elapses.
    pub async fn wait_for_result(&self, key: &CacheKey, max_wait: Duration) -> WaitOutcome {
        let deadline = Instant::now() + max_wait;
        let mut delay = self.config.poll_initial;

        loop {
            if let Some(result) = self.cache.get(key).await {
                return WaitOutcome::Ready(result);
            }
            if self.lock_released(key).await {
                // The holder writes the cache before releasing
                return match self.cache.get(key).await {
                    Some(result) => WaitOutcome::Ready(result),
                    None => WaitOutcome::Released,
                };
            }

            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = delay.mul_f64(self.config.poll_factor).min(self.config.poll_max);
        }
    }

    async fn lock_released(&self, key: &CacheKey) -> bool {
        matches!(self.store.get(&keys::lock(key.as_str())).await, Ok(None))
    }
}

impl std::fmt::Debug for RequestCoalescer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCoalescer")
            .field("config", &self.config)
            .finish()
    }
}
