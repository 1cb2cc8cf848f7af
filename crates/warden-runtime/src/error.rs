//! Orchestration error taxonomy.

use std::time::Duration;
use thiserror::Error;

use crate::providers::ProviderError;
use crate::store::StoreError;
use crate::validation::ValidationError;

/// Why an analysis produced no judgment.
#[derive(Error, Debug, Clone)]
pub enum AnalysisError {
    #[error("Rate limited by {provider}, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Call to {provider} timed out after {after:?}")]
    Timeout { provider: String, after: Duration },

    #[error("Provider {provider} failed: {message}")]
    ProviderError { provider: String, message: String },

    #[error("Malformed response from {provider}: {message}")]
    InvalidResponse { provider: String, message: String },

    #[error("Response from {provider} failed validation: {source}")]
    Validation {
        provider: String,
        #[source]
        source: ValidationError,
    },

    #[error("Circuit open for {provider}")]
    CircuitOpen { provider: String },

    #[error("Budget exceeded: estimated ${estimate_usd:.4} with ${remaining_usd:.4} left")]
    BudgetExceeded {
        estimate_usd: f64,
        remaining_usd: f64,
    },

    #[error("Gave up waiting {waited:?} for in-flight analysis of {key}")]
    LockTimeout { key: String, waited: Duration },

    #[error("No judgment provider available")]
    NoProviderAvailable,

    #[error("{count} questions exceed the batch limit of {max}")]
    TooManyQuestions { count: usize, max: usize },

    #[error("State store error: {0}")]
    Store(#[from] StoreError),
}

impl AnalysisError {
    /// Worth another attempt on the same provider.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AnalysisError::RateLimited { .. }
                | AnalysisError::Timeout { .. }
                | AnalysisError::ProviderError { .. }
        )
    }

    /// Worth one attempt on a different provider.
    pub fn allows_failover(&self) -> bool {
        self.is_retryable()
            || matches!(
                self,
                AnalysisError::InvalidResponse { .. } | AnalysisError::Validation { .. }
            )
    }

    /// Counts against the provider's circuit.
    pub fn is_provider_failure(&self) -> bool {
        self.allows_failover()
    }

    pub fn from_provider(provider: &str, err: ProviderError) -> Self {
        let provider = provider.to_string();
        match err {
            ProviderError::RateLimited { retry_after } => AnalysisError::RateLimited {
                provider,
                retry_after,
            },
            ProviderError::Timeout(after) => AnalysisError::Timeout { provider, after },
            ProviderError::ParseError(message) => {
                AnalysisError::InvalidResponse { provider, message }
            }
            other => AnalysisError::ProviderError {
                provider,
                message: other.to_string(),
            },
        }
    }

    /// Short label for decision records and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AnalysisError::RateLimited { .. } => "rate_limited",
            AnalysisError::Timeout { .. } => "timeout",
            AnalysisError::ProviderError { .. } => "provider_error",
            AnalysisError::InvalidResponse { .. } => "invalid_response",
            AnalysisError::Validation { .. } => "validation_error",
            AnalysisError::CircuitOpen { .. } => "circuit_open",
            AnalysisError::BudgetExceeded { .. } => "budget_exceeded",
            AnalysisError::LockTimeout { .. } => "lock_timeout",
            AnalysisError::NoProviderAvailable => "no_provider_available",
            AnalysisError::TooManyQuestions { .. } => "too_many_questions",
            AnalysisError::Store(_) => "store_error",
        }
    }
}
