//! Model provider trait and HTTP backends.
//!
//! The pipeline talks to a provider through [`ModelProvider`]; the two
//! shipped backends speak the Anthropic Messages API and the OpenAI Chat
//! Completions API over plain HTTP. Provider failures carry a
//! retryable-vs-terminal classification (see [`ModelError::is_retryable`])
//! that decides whether a job is redelivered or its record marked failed.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Outbound request timeout. Model calls are slow; the queue lease must
/// outlive this (see the worker module).
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Default completion budget when the caller does not set one. The Anthropic
/// API requires an explicit value.
const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
}

/// A single message in a completion request.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// A completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Per-request model override (an investigation may ask for a specific
    /// model); the provider's configured model is used otherwise.
    pub model: Option<String>,
}

impl CompletionRequest {
    /// Create a request from a list of messages.
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: None,
            max_tokens: None,
            model: None,
        }
    }

    /// Builder: set temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Builder: set max tokens.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Builder: override the model for this request.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// A completion response.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// A text-completion provider.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Name of the configured model.
    fn model_name(&self) -> &str;

    /// Run a completion request to completion.
    async fn complete(&self, request: CompletionRequest)
    -> Result<CompletionResponse, ModelError>;
}

/// Map a non-success HTTP status to a [`ModelError`].
fn classify_status(
    provider: &str,
    status: u16,
    retry_after: Option<Duration>,
    body: &str,
) -> ModelError {
    match status {
        401 | 403 => ModelError::AuthFailed {
            provider: provider.to_string(),
        },
        408 => ModelError::Timeout {
            provider: provider.to_string(),
        },
        429 => ModelError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        },
        400..=499 => ModelError::InvalidRequest {
            provider: provider.to_string(),
            reason: truncate(body, 500),
        },
        _ => ModelError::Unavailable {
            provider: provider.to_string(),
            reason: format!("HTTP {status}: {}", truncate(body, 200)),
        },
    }
}

/// Map a reqwest transport error to a [`ModelError`].
fn classify_transport(provider: &str, err: reqwest::Error) -> ModelError {
    if err.is_timeout() {
        ModelError::Timeout {
            provider: provider.to_string(),
        }
    } else {
        ModelError::RequestFailed {
            provider: provider.to_string(),
            reason: err.to_string(),
        }
    }
}

fn retry_after_header(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

fn http_client() -> Result<reqwest::Client, ModelError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .build()
        .map_err(|e| ModelError::RequestFailed {
            provider: "http".to_string(),
            reason: format!("Failed to build HTTP client: {e}"),
        })
}

// ── Anthropic ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// Anthropic Messages API backend.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
}

impl AnthropicProvider {
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Result<Self, ModelError> {
        Ok(Self {
            client: http_client()?,
            api_key,
            model: model.into(),
        })
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ModelError> {
        let system = join_system_messages(&request.messages);
        let messages = request
            .messages
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| AnthropicMessage {
                role: "user",
                content: m.content.clone(),
            })
            .collect();

        let body = AnthropicRequest {
            model: request.model.unwrap_or_else(|| self.model.clone()),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system,
            messages,
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport("anthropic", e))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let retry_after = retry_after_header(&response);
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status("anthropic", status, retry_after, &text));
        }

        let parsed: AnthropicResponse =
            response
                .json()
                .await
                .map_err(|e| ModelError::InvalidResponse {
                    provider: "anthropic".to_string(),
                    reason: e.to_string(),
                })?;

        let content: String = parsed
            .content
            .iter()
            .filter_map(|block| match block {
                AnthropicContentBlock::Text { text } => Some(text.as_str()),
                AnthropicContentBlock::Other => None,
            })
            .collect();

        if content.is_empty() {
            return Err(ModelError::InvalidResponse {
                provider: "anthropic".to_string(),
                reason: "response contained no text content".to_string(),
            });
        }

        Ok(CompletionResponse {
            content,
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
        })
    }
}

// ── OpenAI ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: OpenAiUsage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// OpenAI Chat Completions API backend.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
}

impl OpenAiProvider {
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Result<Self, ModelError> {
        Ok(Self {
            client: http_client()?,
            api_key,
            model: model.into(),
        })
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ModelError> {
        let messages = request
            .messages
            .iter()
            .map(|m| OpenAiMessage {
                role: match m.role {
                    Role::System => "system",
                    Role::User => "user",
                },
                content: m.content.clone(),
            })
            .collect();

        let body = OpenAiRequest {
            model: request.model.unwrap_or_else(|| self.model.clone()),
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let response = self
            .client
            .post(OPENAI_API_URL)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport("openai", e))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let retry_after = retry_after_header(&response);
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status("openai", status, retry_after, &text));
        }

        let parsed: OpenAiResponse =
            response
                .json()
                .await
                .map_err(|e| ModelError::InvalidResponse {
                    provider: "openai".to_string(),
                    reason: e.to_string(),
                })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        if content.is_empty() {
            return Err(ModelError::InvalidResponse {
                provider: "openai".to_string(),
                reason: "response contained no choices".to_string(),
            });
        }

        Ok(CompletionResponse {
            content,
            input_tokens: parsed.usage.prompt_tokens,
            output_tokens: parsed.usage.completion_tokens,
        })
    }
}

fn join_system_messages(messages: &[ChatMessage]) -> Option<String> {
    let joined: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    if joined.is_empty() {
        None
    } else {
        Some(joined.join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_status_auth() {
        let err = classify_status("anthropic", 401, None, "unauthorized");
        assert!(matches!(err, ModelError::AuthFailed { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn classify_status_rate_limited_is_retryable() {
        let err = classify_status("openai", 429, Some(Duration::from_secs(30)), "slow down");
        match &err {
            ModelError::RateLimited { retry_after, .. } => {
                assert_eq!(*retry_after, Some(Duration::from_secs(30)));
            }
            other => panic!("Expected RateLimited, got {other:?}"),
        }
        assert!(err.is_retryable());
    }

    #[test]
    fn classify_status_bad_request_is_terminal() {
        let err = classify_status("anthropic", 400, None, "max_tokens required");
        assert!(matches!(err, ModelError::InvalidRequest { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn classify_status_server_error_is_retryable() {
        let err = classify_status("anthropic", 529, None, "overloaded");
        assert!(matches!(err, ModelError::Unavailable { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn anthropic_request_body_shape() {
        let request = CompletionRequest::new(vec![
            ChatMessage::system("You are terse."),
            ChatMessage::user("Hello"),
        ])
        .with_temperature(0.2)
        .with_max_tokens(256);

        let body = AnthropicRequest {
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: request.max_tokens.unwrap(),
            system: join_system_messages(&request.messages),
            messages: vec![AnthropicMessage {
                role: "user",
                content: "Hello".to_string(),
            }],
            temperature: request.temperature,
        };

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["system"], "You are terse.");
        assert_eq!(json["max_tokens"], 256);
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn system_messages_joined() {
        let messages = vec![
            ChatMessage::system("one"),
            ChatMessage::user("hi"),
            ChatMessage::system("two"),
        ];
        assert_eq!(join_system_messages(&messages).unwrap(), "one\n\ntwo");
        assert!(join_system_messages(&[ChatMessage::user("hi")]).is_none());
    }

    #[test]
    fn request_builders() {
        let request = CompletionRequest::new(vec![ChatMessage::user("x")])
            .with_model("gpt-4o")
            .with_temperature(0.7);
        assert_eq!(request.model.as_deref(), Some("gpt-4o"));
        assert_eq!(request.temperature, Some(0.7));
        assert!(request.max_tokens.is_none());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        let truncated = truncate("ééééé", 3);
        assert!(truncated.ends_with('…'));
    }
}
