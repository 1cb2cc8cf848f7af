//! Provider factory pattern for dynamic provider registration.
//!
//! Providers register factories that create instances from
//! [`ProviderConfig`] entries, so adding a backend never touches an enum.
//!
//! ## Usage
//!
//! ```ignore
//! let registry = ProviderRegistry::with_defaults();
//! let providers = registry.create_all(&config.providers)?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{JudgmentProvider, ProviderConfig, ProviderError};

/// Factory for creating providers from configuration.
pub trait ProviderFactory: Send + Sync {
    /// Unique identifier for this provider kind (e.g. "anthropic").
    fn provider_type(&self) -> &'static str;

    fn create(&self, config: &ProviderConfig) -> Result<Arc<dyn JudgmentProvider>, ProviderError>;

    /// Validate configuration without creating a provider.
    fn validate_config(&self, config: &ProviderConfig) -> Result<(), ProviderError>;

    fn description(&self) -> &'static str {
        "Judgment provider"
    }
}

/// Shared `base_url` check for HTTP providers.
pub(crate) fn validate_base_url(config: &ProviderConfig) -> Result<(), ProviderError> {
    match config.setting("base_url") {
        Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => Err(
            ProviderError::NotConfigured("base_url must start with http:// or https://".to_string()),
        ),
        _ => Ok(()),
    }
}

/// Registry of available provider factories.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: BTreeMap<String, Arc<dyn ProviderFactory>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider factory, replacing any with the same kind.
    pub fn register(&mut self, factory: Arc<dyn ProviderFactory>) {
        self.factories
            .insert(factory.provider_type().to_string(), factory);
    }

    /// Registry with the built-in HTTP providers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(super::AnthropicProviderFactory));
        registry.register(Arc::new(super::OpenAiProviderFactory));
        registry
    }

    fn factory(&self, kind: &str) -> Result<&Arc<dyn ProviderFactory>, ProviderError> {
        self.factories.get(kind).ok_or_else(|| {
            ProviderError::NotConfigured(format!(
                "Unknown provider type: '{}'. Available: {:?}",
                kind,
                self.available_types()
            ))
        })
    }

    pub fn create(&self, config: &ProviderConfig) -> Result<Arc<dyn JudgmentProvider>, ProviderError> {
        self.factory(&config.kind)?.create(config)
    }

    /// Create every configured provider, preserving priority order.
    pub fn create_all(
        &self,
        configs: &[ProviderConfig],
    ) -> Result<Vec<Arc<dyn JudgmentProvider>>, ProviderError> {
        configs.iter().map(|c| self.create(c)).collect()
    }

    pub fn validate(&self, config: &ProviderConfig) -> Result<(), ProviderError> {
        self.factory(&config.kind)?.validate_config(config)
    }

    pub fn available_types(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }

    pub fn has_provider(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.available_types())
            .finish()
    }
}
