//! Vision Language Model (VLM) decision service.
//!
//! Provides the decision-service capability used by the agent loop and the
//! case generator:
//! - [`DecisionService`]: the capability itself (conversation in, free text out)
//! - [`ChatClient`]: an OpenAI-compatible chat-completions client
//! - [`Retrying`]: wraps any service with bounded backoff on transient failures
//! - [`check_health`]: reachability check before a long batch
//!
//! # Configuration
//!
//! Client settings default from the environment (see [`crate::config`]):
//! - `UI_VERDICT_API_BASE`: base URL, `/chat/completions` is appended
//! - `UI_VERDICT_API_KEY`: bearer credential
//! - `UI_VERDICT_MODEL`: model name
//! - `UI_VERDICT_MAX_TOKENS`: max tokens in a reply
//! - `UI_VERDICT_REQUEST_TIMEOUT`: per-request timeout (seconds)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};
use tracing::debug;

use crate::config;
use crate::conversation::{Content, Conversation};
use crate::retry::RetryPolicy;

/// Result type for VLM operations
pub type VlmResult<T> = Result<T, VlmError>;

/// Errors that can occur while talking to the decision service
#[derive(Debug, thiserror::Error)]
pub enum VlmError {
    /// Transport-level failure (connect, timeout, broken body)
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// Non-success HTTP status
    #[error("service returned status {status}: {body}")]
    Status { status: u16, body: String },
    /// Response did not carry any usable text
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    /// Client could not be built from its configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl VlmError {
    /// Transport errors, rate limits and server-side errors are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            VlmError::ConnectionFailed(_) | VlmError::InvalidResponse(_) => true,
            VlmError::Status { status, .. } => {
                matches!(status, 408 | 409 | 425 | 429) || *status >= 500
            }
            VlmError::Config(_) => false,
        }
    }
}

impl From<reqwest::Error> for VlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            VlmError::InvalidResponse(e.to_string())
        } else {
            VlmError::ConnectionFailed(e.to_string())
        }
    }
}

/// A remote service that reads a conversation and answers with free text.
#[async_trait]
pub trait DecisionService: Send + Sync {
    async fn complete(&self, conversation: &Conversation) -> VlmResult<String>;
}

#[async_trait]
impl<T: DecisionService + ?Sized> DecisionService for Arc<T> {
    async fn complete(&self, conversation: &Conversation) -> VlmResult<String> {
        (**self).complete(conversation).await
    }
}

/// Configuration for the chat-completions client
#[derive(Debug, Clone)]
pub struct VlmConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`
    pub api_base: String,
    /// Bearer credential (may be empty for local servers)
    pub api_key: String,
    /// Model name to use
    pub model: String,
    /// Maximum tokens in a reply
    pub max_tokens: u32,
    /// Per-request timeout (seconds)
    pub request_timeout: u64,
}

impl Default for VlmConfig {
    fn default() -> Self {
        let cfg = config::get();
        Self {
            api_base: cfg.service.api_base.clone(),
            api_key: cfg.service.api_key.clone(),
            model: cfg.service.model.clone(),
            max_tokens: cfg.service.max_tokens,
            request_timeout: cfg.service.request_timeout,
        }
    }
}

impl VlmConfig {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            ..Default::default()
        }
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn request_timeout(mut self, seconds: u64) -> Self {
        self.request_timeout = seconds;
        self
    }

    /// Full chat-completions endpoint
    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base.trim_end_matches('/'))
    }
}

/// OpenAI-compatible chat-completions client
#[derive(Debug, Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    config: VlmConfig,
}

impl ChatClient {
    pub fn new(config: VlmConfig) -> VlmResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let key = config.api_key.trim();
        if !key.is_empty() {
            let bearer = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| VlmError::Config(format!("invalid API key header: {}", e)))?;
            headers.insert(AUTHORIZATION, bearer);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout.max(1)))
            .build()
            .map_err(|e| VlmError::Config(e.to_string()))?;

        Ok(Self { http, config })
    }

    pub fn config(&self) -> &VlmConfig {
        &self.config
    }
}

#[async_trait]
impl DecisionService for ChatClient {
    async fn complete(&self, conversation: &Conversation) -> VlmResult<String> {
        let body = build_request_body(&self.config, conversation);
        let response = self.http.post(self.config.endpoint()).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VlmError::Status {
                status: status.as_u16(),
                body: truncate(&body, 500),
            });
        }

        let json: Value = response.json().await?;
        let content = extract_content(&json)?;
        debug!(model = %self.config.model, chars = content.len(), "decision received");
        Ok(content)
    }
}

/// Decision service with bounded backoff on retryable failures
#[derive(Debug, Clone)]
pub struct Retrying<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> Retrying<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl<S: DecisionService> DecisionService for Retrying<S> {
    async fn complete(&self, conversation: &Conversation) -> VlmResult<String> {
        self.policy
            .run(
                "decision-service",
                |_| self.inner.complete(conversation),
                VlmError::is_retryable,
            )
            .await
    }
}

/// Check whether the service host answers at all.
///
/// Any HTTP response, even 4xx/5xx, counts as reachable; only a failed
/// connection does not. Model calls can take far longer than this check.
pub async fn check_health(api_base: &str, timeout: Duration) -> bool {
    let url = format!("{}/models", api_base.trim_end_matches('/'));
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(_) => return false,
    };
    client.get(url).send().await.is_ok()
}

/// Build the chat-completions payload for a conversation.
///
/// Turns with a screenshot become a two-part content array (text, then a
/// base64 PNG data URL); plain turns stay plain strings.
pub fn build_request_body(config: &VlmConfig, conversation: &Conversation) -> Value {
    let messages: Vec<Value> = conversation
        .iter()
        .map(|turn| {
            let content = match &turn.content {
                Content::Text(text) => Value::String(text.clone()),
                Content::TextWithImage { text, png } => {
                    let encoded = base64::engine::general_purpose::STANDARD.encode(png.as_slice());
                    json!([
                        { "type": "text", "text": text },
                        {
                            "type": "image_url",
                            "image_url": { "url": format!("data:image/png;base64,{}", encoded) }
                        }
                    ])
                }
            };
            json!({ "role": turn.role.as_str(), "content": content })
        })
        .collect();

    json!({
        "model": config.model,
        "messages": messages,
        "max_tokens": config.max_tokens,
    })
}

/// Pull the reply text out of a chat-completions response.
pub fn extract_content(response: &Value) -> VlmResult<String> {
    let message = &response["choices"][0]["message"];

    let content = match &message["content"] {
        Value::String(s) => s.clone(),
        // Some servers return content as an array of typed parts
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    };

    if !content.trim().is_empty() {
        return Ok(content);
    }

    // Thinking models sometimes put everything in reasoning_content
    match message["reasoning_content"].as_str() {
        Some(reasoning) if !reasoning.trim().is_empty() => Ok(reasoning.to_string()),
        _ => Err(VlmError::InvalidResponse(format!(
            "no message content in response: {}",
            truncate(&response.to_string(), 200)
        ))),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max_chars).collect();
        out.push('…');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vlm_config_builder() {
        let config = VlmConfig::new("http://localhost:8080/v1/")
            .api_key("secret")
            .model("llava")
            .max_tokens(200)
            .request_timeout(30);

        assert_eq!(config.endpoint(), "http://localhost:8080/v1/chat/completions");
        assert_eq!(config.model, "llava");
        assert_eq!(config.max_tokens, 200);
        assert_eq!(config.request_timeout, 30);
    }

    #[test]
    fn test_request_body_layout() {
        let config = VlmConfig::new("http://x").model("m").max_tokens(10);
        let mut conv = Conversation::new("be a tester", 6);
        conv.push_user(Content::TextWithImage {
            text: "elements".to_string(),
            png: Arc::new(vec![0x89, 0x50]),
        });
        conv.push_assistant("Action: Wait");

        let body = build_request_body(&config, &conv);
        assert_eq!(body["model"], "m");
        assert_eq!(body["max_tokens"], 10);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "be a tester");
        assert_eq!(messages[1]["content"][0]["text"], "elements");
        assert!(
            messages[1]["content"][1]["image_url"]["url"]
                .as_str()
                .unwrap()
                .starts_with("data:image/png;base64,")
        );
        assert_eq!(messages[2]["role"], "assistant");
    }

    #[test]
    fn test_extract_content_variants() {
        let plain = json!({"choices": [{"message": {"content": "Action: Wait"}}]});
        assert_eq!(extract_content(&plain).unwrap(), "Action: Wait");

        let parts = json!({"choices": [{"message": {"content": [
            {"type": "text", "text": "Action: "}, {"type": "text", "text": "GoBack"}
        ]}}]});
        assert_eq!(extract_content(&parts).unwrap(), "Action: GoBack");

        let reasoning = json!({"choices": [{"message": {"content": "", "reasoning_content": "Action: Wait"}}]});
        assert_eq!(extract_content(&reasoning).unwrap(), "Action: Wait");

        let empty = json!({"choices": []});
        assert!(matches!(extract_content(&empty), Err(VlmError::InvalidResponse(_))));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(VlmError::ConnectionFailed("reset".into()).is_retryable());
        assert!(VlmError::Status { status: 429, body: String::new() }.is_retryable());
        assert!(VlmError::Status { status: 503, body: String::new() }.is_retryable());
        assert!(!VlmError::Status { status: 401, body: String::new() }.is_retryable());
        assert!(!VlmError::Config("bad".into()).is_retryable());
    }
}
