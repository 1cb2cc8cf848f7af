//! Runtime configuration.
//!
//! Loaded from YAML or JSON. Every section has defaults, so a file only
//! needs to list providers:
//!
//! ```yaml
//! providers:
//!   - kind: anthropic
//!     model: claude-sonnet-4-5-20250929
//!   - kind: openai
//!     model: gpt-4o-mini
//!     pricing: { input_per_million: 0.15, output_per_million: 0.6 }
//! circuit_breaker:
//!   cooldown: 30s
//! budget:
//!   daily_limit_usd: 5.0
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use warden_core::{EngineConfig, DEFAULT_MAX_QUESTIONS};

use crate::cache::CacheConfig;
use crate::coalescer::CoalescingConfig;
use crate::providers::ProviderConfig;
use crate::resilience::{BudgetConfig, CircuitBreakerConfig, RetryConfig};

/// Errors loading or checking configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Human-readable durations (`"500ms"`, `"30s"`, `"6h"`).
pub(crate) mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

fn default_max_questions() -> usize {
    DEFAULT_MAX_QUESTIONS
}

fn default_health_cache_ttl() -> Duration {
    Duration::from_secs(5)
}

/// Everything the runtime needs besides collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Priority order: first healthy provider wins
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub coalescing: CoalescingConfig,

    #[serde(default)]
    pub budget: BudgetConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    /// Default and no-judgment actions
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default = "default_max_questions")]
    pub max_questions_per_batch: usize,

    /// How long a health check result is reused
    #[serde(default = "default_health_cache_ttl", with = "duration_str")]
    pub health_cache_ttl: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            coalescing: CoalescingConfig::default(),
            budget: BudgetConfig::default(),
            cache: CacheConfig::default(),
            engine: EngineConfig::default(),
            max_questions_per_batch: default_max_questions(),
            health_cache_ttl: default_health_cache_ttl(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load by extension: `.json` is JSON, anything else YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    /// Engine policy with the batch cap taken from the top-level setting.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_questions_per_batch: self.max_questions_per_batch,
            ..self.engine.clone()
        }
    }

    /// Check cross-field invariants. Reports every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.providers.is_empty() {
            problems.push("at least one provider is required".to_string());
        }
        let mut names = std::collections::BTreeSet::new();
        for provider in &self.providers {
            if !names.insert(provider.instance_name()) {
                problems.push(format!(
                    "duplicate provider name '{}'",
                    provider.instance_name()
                ));
            }
        }

        problems.extend(self.circuit_breaker.problems());
        problems.extend(self.retry.problems());
        problems.extend(self.coalescing.problems());
        problems.extend(self.budget.problems());
        problems.extend(self.cache.problems());

        if self.max_questions_per_batch == 0 {
            problems.push("max_questions_per_batch must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}
