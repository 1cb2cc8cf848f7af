//! Shared state store.
//!
//! Circuit records, in-flight locks, budget counters, the cost ledger and
//! cached results all live behind [`StateStore`], so every handler sharing a
//! store sees the same breaker, budget and lock state. Mutations that must
//! not lose updates are expressed as the store's atomic operations
//! (conditional create, compare-and-swap, increment), never as a separate
//! read and write.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

mod memory;

pub use memory::MemoryStore;

/// Errors from the state store.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("State store unavailable: {0}")]
    Unavailable(String),

    #[error("Value at '{key}' is not an integer")]
    NotAnInteger { key: String },

    #[error("Failed to encode value for '{key}': {message}")]
    Encode { key: String, message: String },
}

/// Key-value store with expiring entries and atomic primitives.
///
/// `ttl = None` means the entry never expires. Expired entries are
/// invisible to every operation.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Create `key` only if absent. Returns whether it was created.
    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Replace the value only if it currently equals `expected`
    /// (`None` = absent). Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: String,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Atomically add `delta`, creating the key at 0 first. `ttl` applies
    /// only when the key is created.
    async fn incr_by(&self, key: &str, delta: i64, ttl: Option<Duration>)
        -> Result<i64, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Decode a JSON value. A value that fails to decode is reported as
/// `Err(raw)` so the caller can decide whether to drop it.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<Result<T, String>>, StoreError> {
    Ok(store
        .get(key)
        .await?
        .map(|raw| serde_json::from_str(&raw).map_err(|e| e.to_string())))
}

pub fn encode_json<T: Serialize>(key: &str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Encode {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Every key the runtime writes.
pub mod keys {
    use chrono::{DateTime, Utc};

    pub fn circuit(provider: &str) -> String {
        format!("circuit:{}", provider)
    }

    pub fn lock(cache_key: &str) -> String {
        format!("lock:{}", cache_key)
    }

    pub fn cache(cache_key: &str) -> String {
        format!("cache:{}", cache_key)
    }

    pub fn budget_day(at: DateTime<Utc>) -> String {
        format!("budget:day:{}", day(at))
    }

    pub fn budget_month(at: DateTime<Utc>) -> String {
        format!("budget:month:{}", at.format("%Y-%m"))
    }

    pub fn budget_provider_day(at: DateTime<Utc>, provider: &str) -> String {
        format!("budget:day:{}:provider:{}", day(at), provider)
    }

    pub fn ledger_seq(date: &str) -> String {
        format!("ledger:{}:seq", date)
    }

    pub fn ledger_entry(date: &str, seq: i64) -> String {
        format!("ledger:{}:{}", date, seq)
    }

    pub fn day(at: DateTime<Utc>) -> String {
        at.format("%Y-%m-%d").to_string()
    }
}

/// A store whose every operation fails.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub struct DownStore;

    fn down<T>() -> Result<T, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    #[async_trait]
    impl StateStore for DownStore {
        async fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
            down()
        }

        async fn set(&self, _: &str, _: String, _: Option<Duration>) -> Result<(), StoreError> {
            down()
        }

        async fn set_if_absent(&self, _: &str, _: String, _: Option<Duration>) -> Result<bool, StoreError> {
            down()
        }

        async fn compare_and_swap(
            &self,
            _: &str,
            _: Option<&str>,
            _: String,
            _: Option<Duration>,
        ) -> Result<bool, StoreError> {
            down()
        }

        async fn incr_by(&self, _: &str, _: i64, _: Option<Duration>) -> Result<i64, StoreError> {
            down()
        }

        async fn delete(&self, _: &str) -> Result<(), StoreError> {
            down()
        }
    }
}
