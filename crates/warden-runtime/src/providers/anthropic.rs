//! Anthropic Messages API provider.
//!
//! ## Security
//!
//! This provider uses the centralized [`ApiCredential`] system for
//! credential handling. See the [`secrets`](super::secrets) module.

// Wire types are only read by the HTTP path
#![cfg_attr(not(feature = "anthropic"), allow(dead_code))]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
#[cfg(feature = "anthropic")]
use std::time::Duration;

use super::{
    factory::ProviderFactory,
    secrets::{ApiCredential, CredentialSource},
    JudgmentProvider, Pricing, ProviderConfig, ProviderError, ProviderResponse,
};
use crate::prompts::JudgmentRequest;

/// Environment variable name for Anthropic API key.
pub const ANTHROPIC_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";

/// Anthropic Claude provider.
pub struct AnthropicProvider {
    name: String,
    model: String,
    credential: ApiCredential,
    base_url: String,
    pricing: Pricing,
    max_output_tokens: u32,
    #[cfg(feature = "anthropic")]
    client: reqwest::Client,
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("credential", &self.credential)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl AnthropicProvider {
    /// Create with an explicit key and default settings.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_credential(
            ApiCredential::new(api_key, CredentialSource::Programmatic, "Anthropic API key"),
            &ProviderConfig::new("anthropic", model),
        )
    }

    /// Create from a provider config entry, falling back to
    /// `ANTHROPIC_API_KEY` when the settings carry no `api_key`.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let credential = ApiCredential::from_config_or_env(
            &config.settings,
            "api_key",
            ANTHROPIC_API_KEY_ENV,
            "Anthropic API key",
        )?;
        Ok(Self::with_credential(credential, config))
    }

    fn with_credential(credential: ApiCredential, config: &ProviderConfig) -> Self {
        Self {
            name: config.instance_name().to_string(),
            model: config.model.clone(),
            credential,
            base_url: config
                .setting("base_url")
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            pricing: config.pricing,
            max_output_tokens: config.max_output_tokens,
            #[cfg(feature = "anthropic")]
            client: reqwest::Client::new(),
        }
    }

    /// Set custom base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

/// Anthropic API request format.
#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage<'a> {
    role: &'static str,
    content: &'a str,
}

/// Anthropic API response format.
#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlockResponse>,
    model: String,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlockResponse {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    error: AnthropicErrorDetail,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorDetail {
    message: String,
}

fn build_request<'a>(
    model: &'a str,
    max_tokens: u32,
    request: &'a JudgmentRequest,
) -> AnthropicRequest<'a> {
    AnthropicRequest {
        model,
        max_tokens,
        system: &request.system_prompt,
        messages: vec![AnthropicMessage {
            role: "user",
            content: &request.payload,
        }],
        temperature: 0.0,
    }
}

fn parse_response(body: AnthropicResponse) -> ProviderResponse {
    let content = body
        .content
        .into_iter()
        .filter_map(|block| block.text)
        .collect::<Vec<_>>()
        .join("");
    ProviderResponse {
        content,
        usage: super::TokenUsage {
            input_tokens: body.usage.input_tokens,
            output_tokens: body.usage.output_tokens,
        },
        model: body.model,
    }
}

#[async_trait]
impl JudgmentProvider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    #[cfg(feature = "anthropic")]
    async fn complete(&self, request: &JudgmentRequest) -> Result<ProviderResponse, ProviderError> {
        let body = build_request(&self.model, self.max_output_tokens, request);

        // Only expose the credential here, at the point of use
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", self.credential.expose())
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(Duration::ZERO)
                } else {
                    ProviderError::HttpError(e.to_string())
                }
            })?;

        let status = response.status();

        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ProviderError::RateLimited { retry_after });
        }

        if status == 401 || status == 403 {
            return Err(ProviderError::AuthError);
        }

        if !status.is_success() {
            let message = response
                .json::<AnthropicError>()
                .await
                .map(|e| e.error.message)
                .unwrap_or_else(|e| e.to_string());
            return Err(ProviderError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let body: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        Ok(parse_response(body))
    }

    #[cfg(not(feature = "anthropic"))]
    async fn complete(&self, _request: &JudgmentRequest) -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::NotConfigured(
            "Anthropic provider requires 'anthropic' feature".to_string(),
        ))
    }

    async fn health_check(&self) -> bool {
        // Key presence only; never spends tokens
        !self.credential.is_empty()
    }

    fn pricing(&self) -> Pricing {
        self.pricing
    }

    fn max_output_tokens(&self) -> u32 {
        self.max_output_tokens
    }
}

/// Factory for Anthropic providers.
///
/// ## Settings
/// ```yaml
/// kind: anthropic
/// model: claude-sonnet-4-5-20250929
/// settings:
///   api_key: sk-ant-...        # optional, falls back to ANTHROPIC_API_KEY
///   base_url: https://...      # optional
/// ```
pub struct AnthropicProviderFactory;

impl ProviderFactory for AnthropicProviderFactory {
    fn provider_type(&self) -> &'static str {
        "anthropic"
    }

    fn create(&self, config: &ProviderConfig) -> Result<Arc<dyn JudgmentProvider>, ProviderError> {
        Ok(Arc::new(AnthropicProvider::from_config(config)?))
    }

    fn validate_config(&self, config: &ProviderConfig) -> Result<(), ProviderError> {
        if !ApiCredential::is_available(&config.settings, "api_key", ANTHROPIC_API_KEY_ENV) {
            return Err(ProviderError::NotConfigured(format!(
                "Anthropic API key required: set 'api_key' in settings or {} env",
                ANTHROPIC_API_KEY_ENV
            )));
        }
        super::factory::validate_base_url(config)
    }

    fn description(&self) -> &'static str {
        "Anthropic Claude (Messages API)"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompts::RequestKind;
    use warden_core::SubjectId;

    fn request() -> JudgmentRequest {
        JudgmentRequest {
            correlation_id: "c".to_string(),
            subject_id: SubjectId::new("t3_a"),
            kind: RequestKind::RiskAssessment,
            questions: vec![],
            system_prompt: "system".to_string(),
            payload: "{}".to_string(),
            prompt_version: crate::prompts::PROMPT_VERSION,
            fingerprint: String::new(),
        }
    }

    #[test]
    fn test_request_shape() {
        let req = request();
        let body = build_request("claude-test", 512, &req);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "claude-test");
        assert_eq!(json["max_tokens"], 512);
        assert_eq!(json["system"], "system");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"], "{}");
    }

    #[test]
    fn test_response_text_joined() {
        let body: AnthropicResponse = serde_json::from_value(serde_json::json!({
            "content": [{"type": "text", "text": "{\"a\":"}, {"type": "text", "text": "1}"}],
            "model": "claude-test",
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 4}
        }))
        .unwrap();
        let response = parse_response(body);
        assert_eq!(response.content, "{\"a\":1}");
        assert_eq!(response.usage.total(), 14);
    }

    #[test]
    fn test_from_config_uses_instance_name_and_settings() {
        let mut config = ProviderConfig::new("anthropic", "claude-test");
        config.name = Some("claude-primary".to_string());
        config.settings = serde_json::json!({
            "api_key": "config-api-key",
            "base_url": "https://custom.api.com/v1/"
        });

        let provider = AnthropicProvider::from_config(&config).unwrap();
        assert_eq!(provider.name(), "claude-primary");
        assert_eq!(provider.base_url, "https://custom.api.com/v1");
        assert_eq!(provider.credential.source(), CredentialSource::Config);
    }

    #[test]
    fn test_api_key_not_in_debug_output() {
        let secret_key = "sk-ant-REDACTED";
        let provider = AnthropicProvider::new(secret_key, "claude-test");
        let debug_output = format!("{:?}", provider);
        assert!(!debug_output.contains(secret_key));
        assert!(debug_output.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn test_health_check_requires_key() {
        assert!(AnthropicProvider::new("key", "m").health_check().await);
        assert!(!AnthropicProvider::new("", "m").health_check().await);
    }

    #[test]
    fn test_factory_rejects_bad_base_url() {
        let mut config = ProviderConfig::new("anthropic", "m");
        config.settings = serde_json::json!({ "api_key": "k", "base_url": "ftp://x" });
        assert!(AnthropicProviderFactory.validate_config(&config).is_err());
    }

    #[cfg(not(feature = "anthropic"))]
    #[tokio::test]
    async fn test_complete_without_feature() {
        let provider = AnthropicProvider::new("key", "m");
        assert!(matches!(
            provider.complete(&request()).await,
            Err(ProviderError::NotConfigured(_))
        ));
    }
}
