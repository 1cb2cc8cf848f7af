//! Judgment provider abstractions.
//!
//! A provider turns a [`JudgmentRequest`] into raw response text plus token
//! usage. Everything else (breakers, retries, validation, accounting) lives
//! above this layer.
//!
//! ## Security
//!
//! All providers use the [`secrets`] module for credential handling.
//! See [`ApiCredential`] for the recommended patterns.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;
use thiserror::Error;

use crate::prompts::JudgmentRequest;

mod anthropic;
mod factory;
mod openai;
pub mod secrets;

pub use anthropic::{AnthropicProvider, AnthropicProviderFactory, ANTHROPIC_API_KEY_ENV};
pub use factory::{ProviderFactory, ProviderRegistry};
pub use openai::{OpenAiProvider, OpenAiProviderFactory, OPENAI_API_KEY_ENV};
pub use secrets::{ApiCredential, CredentialSource};

/// Errors from judgment providers.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(String),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("JSON parse error: {0}")]
    ParseError(String),

    #[error("Authentication failed")]
    AuthError,

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

/// Token usage from one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Per-million-token prices in USD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Pricing {
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (f64::from(usage.input_tokens) * self.input_per_million
            + f64::from(usage.output_tokens) * self.output_per_million)
            / 1_000_000.0
    }
}

impl Default for Pricing {
    fn default() -> Self {
        // Claude Sonnet 4.5 list prices
        Self {
            input_per_million: 3.0,
            output_per_million: 15.0,
        }
    }
}

/// Raw output of a successful call.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub model: String,
}

fn default_max_output_tokens() -> u32 {
    1024
}

/// One entry of the configured provider priority list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider kind registered with the [`ProviderRegistry`]
    pub kind: String,

    /// Instance name; defaults to the kind
    #[serde(default)]
    pub name: Option<String>,

    pub model: String,

    #[serde(default)]
    pub pricing: Pricing,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    /// Adapter settings (`api_key`, `base_url`, ...)
    #[serde(default)]
    pub settings: JsonValue,
}

impl ProviderConfig {
    pub fn new(kind: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: None,
            model: model.into(),
            pricing: Pricing::default(),
            max_output_tokens: default_max_output_tokens(),
            settings: JsonValue::Null,
        }
    }

    pub fn instance_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.kind)
    }

    /// String setting, if present.
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(JsonValue::as_str)
    }
}

/// A backend that answers judgment requests.
#[async_trait]
pub trait JudgmentProvider: Send + Sync {
    /// Instance name, used as the circuit and accounting key.
    fn name(&self) -> &str;

    async fn complete(&self, request: &JudgmentRequest) -> Result<ProviderResponse, ProviderError>;

    /// Cheap liveness check. Must not spend tokens.
    async fn health_check(&self) -> bool;

    fn pricing(&self) -> Pricing;

    /// Output allowance sent with every request.
    fn max_output_tokens(&self) -> u32;

    fn compute_cost(&self, usage: &TokenUsage) -> f64 {
        self.pricing().cost(usage)
    }

    /// Estimate tokens for a prompt.
    fn estimate_tokens(&self, text: &str) -> u32 {
        // ~4 chars per token
        u32::try_from(text.len().div_ceil(4)).unwrap_or(u32::MAX)
    }
}
