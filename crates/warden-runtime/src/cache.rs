//! Differential result cache.
//!
//! Results are cached in the shared store with a TTL chosen per entry:
//! trusted authors are re-checked less often, and a result that already
//! confirmed high risk is kept longest.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use warden_core::SubjectId;

use crate::clock::{duration_ms, Clock};
use crate::config::duration_str;
use crate::orchestrator::AnalysisResult;
use crate::store::{encode_json, get_json, keys, StateStore, StoreError};

/// Bumped whenever [`AnalysisResult`]'s stored shape changes.
pub const CACHE_SCHEMA_VERSION: u32 = 1;

/// Cache key: the subject alone for a full analysis, or the subject plus a
/// hash of the question-id set for a question batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn full(subject: &SubjectId) -> Self {
        Self(format!("full:{}", subject))
    }

    /// Order and duplicates in `question_ids` do not matter.
    pub fn questions<'a>(subject: &SubjectId, question_ids: impl IntoIterator<Item = &'a str>) -> Self {
        let ids: BTreeSet<&str> = question_ids.into_iter().collect();
        let mut hasher = Sha256::new();
        for id in ids {
            hasher.update(id.as_bytes());
            hasher.update([0u8]);
        }
        Self(format!("questions:{}:{:x}", subject, hasher.finalize()))
    }

    /// Full key for an empty set, batch key otherwise.
    pub fn for_questions<'a>(
        subject: &SubjectId,
        question_ids: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let mut ids = question_ids.into_iter().peekable();
        if ids.peek().is_none() {
            Self::full(subject)
        } else {
            Self::questions(subject, ids)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One row of the TTL table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlTier {
    /// Lowest trust score this tier applies to
    pub min_trust: u8,
    #[serde(with = "duration_str")]
    pub ttl: Duration,
}

impl TtlTier {
    const fn hours(min_trust: u8, hours: u64) -> Self {
        Self {
            min_trust,
            ttl: Duration::from_secs(hours * 3600),
        }
    }
}

/// Cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Ordered by `min_trust`; TTL must not decrease
    pub tiers: Vec<TtlTier>,

    /// For confirmed high or critical risk, regardless of trust
    #[serde(with = "duration_str")]
    pub high_risk_ttl: Duration,

    /// For authors without a trust score; defaults to the lowest tier
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_duration_str")]
    pub unknown_trust_ttl: Option<Duration>,
}

mod opt_duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => super::duration_str::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                TtlTier::hours(0, 1),
                TtlTier::hours(40, 6),
                TtlTier::hours(70, 24),
                TtlTier::hours(90, 72),
            ],
            high_risk_ttl: Duration::from_secs(7 * 24 * 3600),
            unknown_trust_ttl: None,
        }
    }
}

impl CacheConfig {
    pub(crate) fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.tiers.is_empty() {
            problems.push("cache.tiers must not be empty".to_string());
        }
        for pair in self.tiers.windows(2) {
            if pair[1].min_trust <= pair[0].min_trust {
                problems.push(format!(
                    "cache.tiers must be ordered by min_trust ({} after {})",
                    pair[1].min_trust, pair[0].min_trust
                ));
            }
            if pair[1].ttl < pair[0].ttl {
                problems.push(format!(
                    "cache TTL must not decrease as trust increases (trust {} has {:?}, trust {} has {:?})",
                    pair[0].min_trust, pair[0].ttl, pair[1].min_trust, pair[1].ttl
                ));
            }
        }
        let longest = self.tiers.iter().map(|t| t.ttl).max().unwrap_or_default();
        if self.high_risk_ttl < longest {
            problems.push("cache.high_risk_ttl is shorter than the longest tier".to_string());
        }
        problems
    }
}

/// Chooses an entry's TTL.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    tiers: Vec<TtlTier>,
    high_risk_ttl: Duration,
    unknown_trust_ttl: Option<Duration>,
}

impl TtlPolicy {
    pub fn new(config: &CacheConfig) -> Self {
        let mut tiers = config.tiers.clone();
        tiers.sort_by_key(|t| t.min_trust);
        Self {
            tiers,
            high_risk_ttl: config.high_risk_ttl,
            unknown_trust_ttl: config.unknown_trust_ttl,
        }
    }

    pub fn select(&self, trust: Option<u8>, high_risk: bool) -> Duration {
        if high_risk {
            return self.high_risk_ttl;
        }
        let lowest = self.tiers.first().map(|t| t.ttl).unwrap_or_default();
        match trust {
            None => self.unknown_trust_ttl.unwrap_or(lowest),
            Some(score) => self
                .tiers
                .iter()
                .rev()
                .find(|t| t.min_trust <= score)
                .map_or(lowest, |t| t.ttl),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    schema_version: u32,
    expires_at_ms: i64,
    result: AnalysisResult,
}

/// Result cache over the shared store.
pub struct DifferentialCache {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    policy: TtlPolicy,
}

impl DifferentialCache {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, config: &CacheConfig) -> Self {
        Self {
            store,
            clock,
            policy: TtlPolicy::new(config),
        }
    }

    pub fn policy(&self) -> &TtlPolicy {
        &self.policy
    }

    /// A live, well-formed entry. Anything else is a miss; corrupt entries
    /// are deleted.
    pub async fn get(&self, key: &CacheKey) -> Option<AnalysisResult> {
        let store_key = keys::cache(key.as_str());
        let entry = match get_json::<CacheEntry>(self.store.as_ref(), &store_key).await {
            Ok(None) => return None,
            Ok(Some(Ok(entry))) => entry,
            Ok(Some(Err(reason))) => {
                warn!(key = %key, reason = %reason, "Dropping corrupt cache entry");
                self.drop_entry(&store_key).await;
                return None;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                return None;
            }
        };

        if entry.schema_version != CACHE_SCHEMA_VERSION {
            warn!(
                key = %key,
                version = entry.schema_version,
                "Dropping cache entry with stale schema"
            );
            self.drop_entry(&store_key).await;
            return None;
        }
        if self.clock.now_ms() >= entry.expires_at_ms {
            self.drop_entry(&store_key).await;
            return None;
        }
        Some(entry.result)
    }

    /// Store `result` for its own `cache_ttl`.
    pub async fn put(&self, key: &CacheKey, result: &AnalysisResult) -> Result<(), StoreError> {
        let store_key = keys::cache(key.as_str());
        let ttl = result.cache_ttl;
        let entry = CacheEntry {
            schema_version: CACHE_SCHEMA_VERSION,
            expires_at_ms: self.clock.now_ms().saturating_add(duration_ms(ttl)),
            result: result.clone(),
        };
        let value = encode_json(&store_key, &entry)?;
        self.store.set(&store_key, value, Some(ttl)).await
    }

    pub async fn invalidate(&self, key: &CacheKey) -> Result<(), StoreError> {
        self.store.delete(&keys::cache(key.as_str())).await
    }

    async fn drop_entry(&self, store_key: &str) {
        if let Err(e) = self.store.delete(store_key).await {
            warn!(key = %store_key, error = %e, "Failed to delete cache entry");
        }
    }
}

impl fmt::Debug for DifferentialCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DifferentialCache")
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::orchestrator::tests::sample_result;
    use crate::store::MemoryStore;
    use proptest::prelude::*;

    fn cache() -> (DifferentialCache, Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        (
            DifferentialCache::new(store.clone(), clock.clone(), &CacheConfig::default()),
            store,
            clock,
        )
    }

    #[test]
    fn test_question_keys() {
        let subject = SubjectId::new("t3_abc");
        let a = CacheKey::questions(&subject, ["b", "a"]);
        let b = CacheKey::questions(&subject, ["a", "b", "a"]);
        let c = CacheKey::questions(&subject, ["a", "c"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, CacheKey::full(&subject));
        assert!(a.as_str().starts_with("questions:t3_abc:"));
        assert_eq!(CacheKey::full(&subject).as_str(), "full:t3_abc");
        assert_eq!(CacheKey::for_questions(&subject, std::iter::empty()), CacheKey::full(&subject));
    }

    #[test]
    fn test_ttl_tiers() {
        let policy = TtlPolicy::new(&CacheConfig::default());
        let h = |n: u64| Duration::from_secs(n * 3600);
        assert_eq!(policy.select(Some(10), false), h(1));
        assert_eq!(policy.select(Some(40), false), h(6));
        assert_eq!(policy.select(Some(89), false), h(24));
        assert_eq!(policy.select(Some(100), false), h(72));
        assert_eq!(policy.select(None, false), h(1));
        assert_eq!(policy.select(Some(5), true), h(7 * 24));
    }

    proptest! {
        #[test]
        fn prop_ttl_monotonic_in_trust(t1 in 0u8..=100, t2 in 0u8..=100, high in any::<bool>()) {
            let policy = TtlPolicy::new(&CacheConfig::default());
            let (lo, hi) = if t1 <= t2 { (t1, t2) } else { (t2, t1) };
            prop_assert!(policy.select(Some(lo), high) <= policy.select(Some(hi), high));
            prop_assert!(policy.select(Some(lo), true) >= policy.select(Some(hi), false));
        }
    }

    #[tokio::test]
    async fn test_round_trip_and_expiry() {
        let (cache, _, clock) = cache();
        let key = CacheKey::full(&SubjectId::new("t3_a"));
        let mut result = sample_result();
        result.cache_ttl = Duration::from_secs(3600);

        cache.put(&key, &result).await.unwrap();
        assert_eq!(cache.get(&key).await, Some(result));

        clock.advance(Duration::from_secs(3600));
        assert_eq!(cache.get(&key).await, None);
    }

    #[tokio::test]
    async fn test_corrupt_entry_deleted() {
        let (cache, store, _) = cache();
        let key = CacheKey::full(&SubjectId::new("t3_a"));
        store
            .set(&keys::cache(key.as_str()), "{\"schema_version\":1}".into(), None)
            .await
            .unwrap();

        assert_eq!(cache.get(&key).await, None);
        assert!(store.get(&keys::cache(key.as_str())).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_schema_mismatch_deleted() {
        let (cache, store, clock) = cache();
        let key = CacheKey::full(&SubjectId::new("t3_a"));
        let entry = CacheEntry {
            schema_version: CACHE_SCHEMA_VERSION + 1,
            expires_at_ms: clock.now_ms() + 60_000,
            result: sample_result(),
        };
        store
            .set(&keys::cache(key.as_str()), serde_json::to_string(&entry).unwrap(), None)
            .await
            .unwrap();

        assert_eq!(cache.get(&key).await, None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate() {
        let (cache, _, _) = cache();
        let key = CacheKey::full(&SubjectId::new("t3_a"));
        cache.put(&key, &sample_result()).await.unwrap();
        cache.invalidate(&key).await.unwrap();
        assert_eq!(cache.get(&key).await, None);
    }
}
