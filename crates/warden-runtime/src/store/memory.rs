//! In-process state store.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{StateStore, StoreError};
use crate::clock::{duration_ms, Clock, SystemClock};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at_ms: Option<i64>,
}

impl Entry {
    fn live(&self, now_ms: i64) -> bool {
        self.expires_at_ms.map_or(true, |at| now_ms < at)
    }
}

/// A [`StateStore`] backed by a mutex-guarded map.
///
/// Each operation holds the lock for its whole read-check-write, which is
/// what makes the conditional operations atomic. Expired entries are
/// dropped lazily when touched.
#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<i64> {
        ttl.map(|ttl| self.clock.now_ms().saturating_add(duration_ms(ttl)))
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.entries.lock().values().filter(|e| e.live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Live value for `key`, removing it if expired.
fn live_value<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now_ms: i64,
) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|e| !e.live(now_ms)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        Ok(live_value(&mut entries, key, now).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at_ms = self.expiry(ttl);
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value,
                expires_at_ms,
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let expires_at_ms = self.expiry(ttl);
        let mut entries = self.entries.lock();
        if live_value(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at_ms,
            },
        );
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: String,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let expires_at_ms = self.expiry(ttl);
        let mut entries = self.entries.lock();
        let current = live_value(&mut entries, key, now).map(|e| e.value.as_str());
        if current != expected {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: new,
                expires_at_ms,
            },
        );
        Ok(true)
    }

    async fn incr_by(
        &self,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, StoreError> {
        let now = self.clock.now_ms();
        let expires_at_ms = self.expiry(ttl);
        let mut entries = self.entries.lock();
        match live_value(&mut entries, key, now) {
            Some(entry) => {
                let current: i64 = entry.value.parse().map_err(|_| StoreError::NotAnInteger {
                    key: key.to_string(),
                })?;
                let next = current.saturating_add(delta);
                entry.value = next.to_string();
                Ok(next)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: delta.to_string(),
                        expires_at_ms,
                    },
                );
                Ok(delta)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::default());
        let store = MemoryStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let (clock, store) = store();
        store
            .set("k", "v".to_string(), Some(Duration::from_secs(30)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        clock.advance(Duration::from_secs(30));
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_set_if_absent_respects_expiry() {
        let (clock, store) = store();
        let ttl = Some(Duration::from_secs(30));
        assert!(store.set_if_absent("lock", "a".into(), ttl).await.unwrap());
        assert!(!store.set_if_absent("lock", "b".into(), ttl).await.unwrap());

        clock.advance(Duration::from_secs(31));
        assert!(store.set_if_absent("lock", "c".into(), ttl).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let (_, store) = store();
        assert!(store.compare_and_swap("k", None, "1".into(), None).await.unwrap());
        assert!(!store.compare_and_swap("k", None, "2".into(), None).await.unwrap());
        assert!(!store
            .compare_and_swap("k", Some("0"), "2".into(), None)
            .await
            .unwrap());
        assert!(store
            .compare_and_swap("k", Some("1"), "2".into(), None)
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_incr_by() {
        let (clock, store) = store();
        let ttl = Some(Duration::from_secs(60));
        assert_eq!(store.incr_by("n", 5, ttl).await.unwrap(), 5);
        assert_eq!(store.incr_by("n", -2, ttl).await.unwrap(), 3);

        // TTL is set on create only
        clock.advance(Duration::from_secs(61));
        assert_eq!(store.incr_by("n", 1, ttl).await.unwrap(), 1);

        store.set("s", "abc".into(), None).await.unwrap();
        assert!(matches!(
            store.incr_by("s", 1, None).await,
            Err(StoreError::NotAnInteger { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStore::new());
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.incr_by("n", 2, None).await.unwrap() })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.get("n").await.unwrap().as_deref(), Some("100"));
    }
}
