//! Provider selection in priority order.

use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::CircuitBreaker;
use crate::error::AnalysisError;
use crate::providers::JudgmentProvider;

/// Picks the first usable provider.
///
/// A provider is usable when its circuit is not open and its health check
/// passes. Check results are cached for a few seconds; circuit state is
/// read from the store on every selection.
pub struct ProviderSelector {
    providers: Vec<Arc<dyn JudgmentProvider>>,
    breaker: Arc<CircuitBreaker>,
    health: Cache<String, bool>,
}

impl ProviderSelector {
    pub fn new(
        providers: Vec<Arc<dyn JudgmentProvider>>,
        breaker: Arc<CircuitBreaker>,
        health_ttl: Duration,
    ) -> Self {
        let health = Cache::builder()
            .max_capacity(providers.len().max(1) as u64 * 4)
            .time_to_live(health_ttl)
            .build();
        Self {
            providers,
            breaker,
            health,
        }
    }

    pub fn providers(&self) -> &[Arc<dyn JudgmentProvider>] {
        &self.providers
    }

    /// First provider in priority order that is not excluded, not open and
    /// healthy.
    pub async fn select_provider(
        &self,
        excluding: &[&str],
    ) -> Result<Arc<dyn JudgmentProvider>, AnalysisError> {
        for provider in &self.providers {
            let name = provider.name();
            if excluding.contains(&name) {
                continue;
            }
            if self.breaker.is_open(name).await {
                debug!(provider = %name, "Skipping provider with open circuit");
                continue;
            }
            if !self.is_healthy(provider).await {
                debug!(provider = %name, "Skipping unhealthy provider");
                continue;
            }
            return Ok(provider.clone());
        }
        Err(AnalysisError::NoProviderAvailable)
    }

    async fn is_healthy(&self, provider: &Arc<dyn JudgmentProvider>) -> bool {
        self.health
            .get_with(provider.name().to_string(), async {
                provider.health_check().await
            })
            .await
    }
}

impl std::fmt::Debug for ProviderSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.providers.iter().map(|p| p.name()).collect();
        f.debug_struct("ProviderSelector")
            .field("providers", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::prompts::JudgmentRequest;
    use crate::providers::{Pricing, ProviderError, ProviderResponse};
    use crate::resilience::CircuitBreakerConfig;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Pinged {
        name: &'static str,
        healthy: AtomicBool,
        checks: AtomicUsize,
    }

    impl Pinged {
        fn new(name: &'static str, healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                healthy: AtomicBool::new(healthy),
                checks: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl JudgmentProvider for Pinged {
        fn name(&self) -> &str {
            self.name
        }

        async fn complete(&self, _: &JudgmentRequest) -> Result<ProviderResponse, ProviderError> {
            Err(ProviderError::NotConfigured("pinged".into()))
        }

        async fn health_check(&self) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.healthy.load(Ordering::SeqCst)
        }

        fn pricing(&self) -> Pricing {
            Pricing::default()
        }

        fn max_output_tokens(&self) -> u32 {
            100
        }
    }

    fn selector(providers: Vec<Arc<dyn JudgmentProvider>>) -> (ProviderSelector, Arc<CircuitBreaker>) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let breaker = Arc::new(CircuitBreaker::new(
            store,
            clock,
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            },
        ));
        (
            ProviderSelector::new(providers, breaker.clone(), Duration::from_secs(5)),
            breaker,
        )
    }

    #[tokio::test]
    async fn test_priority_order_and_exclusion() {
        let (sel, _) = selector(vec![Pinged::new("a", true), Pinged::new("b", true)]);
        assert_eq!(sel.select_provider(&[]).await.unwrap().name(), "a");
        assert_eq!(sel.select_provider(&["a"]).await.unwrap().name(), "b");
        assert!(matches!(
            sel.select_provider(&["a", "b"]).await,
            Err(AnalysisError::NoProviderAvailable)
        ));
    }

    #[tokio::test]
    async fn test_skips_open_circuit_and_unhealthy() {
        let (sel, breaker) = selector(vec![
            Pinged::new("a", true),
            Pinged::new("b", false),
            Pinged::new("c", true),
        ]);
        breaker.record_failure("a").await;
        assert_eq!(sel.select_provider(&[]).await.unwrap().name(), "c");
    }

    #[tokio::test]
    async fn test_health_check_cached() {
        let pinged = Pinged::new("a", true);
        let (sel, _) = selector(vec![pinged.clone()]);
        for _ in 0..3 {
            sel.select_provider(&[]).await.unwrap();
        }
        assert_eq!(pinged.checks.load(Ordering::SeqCst), 1);
    }
}
