//! OpenAI Chat Completions provider.

// Wire types are only read by the HTTP path
#![cfg_attr(not(feature = "openai"), allow(dead_code))]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
#[cfg(feature = "openai")]
use std::time::Duration;

use super::{
    factory::ProviderFactory,
    secrets::{ApiCredential, CredentialSource},
    JudgmentProvider, Pricing, ProviderConfig, ProviderError, ProviderResponse, TokenUsage,
};
use crate::prompts::JudgmentRequest;

/// Environment variable name for OpenAI API key.
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI (or compatible) chat completions provider.
pub struct OpenAiProvider {
    name: String,
    model: String,
    credential: ApiCredential,
    base_url: String,
    pricing: Pricing,
    max_output_tokens: u32,
    #[cfg(feature = "openai")]
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("credential", &self.credential)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_credential(
            ApiCredential::new(api_key, CredentialSource::Programmatic, "OpenAI API key"),
            &ProviderConfig::new("openai", model),
        )
    }

    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let credential = ApiCredential::from_config_or_env(
            &config.settings,
            "api_key",
            OPENAI_API_KEY_ENV,
            "OpenAI API key",
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
            #[cfg(feature = "openai")]
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: [ChatMessage<'a>; 2],
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    type_: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: String,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAiError {
    error: OpenAiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorDetail {
    message: String,
}

fn build_request<'a>(model: &'a str, max_tokens: u32, request: &'a JudgmentRequest) -> ChatRequest<'a> {
    ChatRequest {
        model,
        max_tokens,
        temperature: 0.0,
        messages: [
            ChatMessage {
                role: "system",
                content: &request.system_prompt,
            },
            ChatMessage {
                role: "user",
                content: &request.payload,
            },
        ],
        response_format: ResponseFormat {
            type_: "json_object",
        },
    }
}

fn parse_response(body: ChatResponse) -> Result<ProviderResponse, ProviderError> {
    let content = body
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| ProviderError::ParseError("response has no choices".to_string()))?;
    let usage = body
        .usage
        .map(|u| TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        })
        .unwrap_or_default();
    Ok(ProviderResponse {
        content,
        usage,
        model: body.model,
    })
}

#[async_trait]
impl JudgmentProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    #[cfg(feature = "openai")]
    async fn complete(&self, request: &JudgmentRequest) -> Result<ProviderResponse, ProviderError> {
        let body = build_request(&self.model, self.max_output_tokens, request);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.credential.expose())
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
                .json::<OpenAiError>()
                .await
                .map(|e| e.error.message)
                .unwrap_or_else(|e| e.to_string());
            return Err(ProviderError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        parse_response(body)
    }

    #[cfg(not(feature = "openai"))]
    async fn complete(&self, _request: &JudgmentRequest) -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::NotConfigured(
            "OpenAI provider requires 'openai' feature".to_string(),
        ))
    }

    async fn health_check(&self) -> bool {
        !self.credential.is_empty()
    }

    fn pricing(&self) -> Pricing {
        self.pricing
    }

    fn max_output_tokens(&self) -> u32 {
        self.max_output_tokens
    }
}

/// Factory for OpenAI providers. `base_url` may point at any compatible
/// endpoint.
pub struct OpenAiProviderFactory;

impl ProviderFactory for OpenAiProviderFactory {
    fn provider_type(&self) -> &'static str {
        "openai"
    }

    fn create(&self, config: &ProviderConfig) -> Result<Arc<dyn JudgmentProvider>, ProviderError> {
        Ok(Arc::new(OpenAiProvider::from_config(config)?))
    }

    fn validate_config(&self, config: &ProviderConfig) -> Result<(), ProviderError> {
        if !ApiCredential::is_available(&config.settings, "api_key", OPENAI_API_KEY_ENV) {
            return Err(ProviderError::NotConfigured(format!(
                "OpenAI API key required: set 'api_key' in settings or {} env",
                OPENAI_API_KEY_ENV
            )));
        }
        super::factory::validate_base_url(config)
    }

    fn description(&self) -> &'static str {
        "OpenAI Chat Completions (or compatible)"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompts::{RequestKind, PROMPT_VERSION};
    use warden_core::SubjectId;

    #[test]
    fn test_request_uses_json_mode() {
        let req = JudgmentRequest {
            correlation_id: "c".to_string(),
            subject_id: SubjectId::new("t1_a"),
            kind: RequestKind::Questions,
            questions: vec![],
            system_prompt: "sys".to_string(),
            payload: "{\"q\":1}".to_string(),
            prompt_version: PROMPT_VERSION,
            fingerprint: String::new(),
        };
        let json = serde_json::to_value(build_request("gpt-test", 256, &req)).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "{\"q\":1}");
        assert_eq!(json["response_format"]["type"], "json_object");
    }

    #[test]
    fn test_parse_response() {
        let body: ChatResponse = serde_json::from_value(serde_json::json!({
            "model": "gpt-test",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "{}"}}],
            "usage": {"prompt_tokens": 30, "completion_tokens": 2, "total_tokens": 32}
        }))
        .unwrap();
        let response = parse_response(body).unwrap();
        assert_eq!(response.content, "{}");
        assert_eq!(response.usage.input_tokens, 30);

        let empty: ChatResponse =
            serde_json::from_value(serde_json::json!({"model": "m", "choices": []})).unwrap();
        assert!(matches!(parse_response(empty), Err(ProviderError::ParseError(_))));
    }

    #[test]
    fn test_api_key_not_in_debug_output() {
        let provider = OpenAiProvider::new("sk-openai-secret", "gpt-test");
        assert!(!format!("{:?}", provider).contains("sk-openai-secret"));
    }
}
