//! Chat-completion endpoint contract.
//!
//! The dispatcher core requires, but does not implement, a single async
//! `chat` operation. Production deployments plug in an HTTP client;
//! tests plug in scripted fakes. Server retry hints travel either in the
//! `retry_after` field, the `retry-after` header, or the error text.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Request passed to the endpoint for one completion call.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Provider-shaped `response_format` payload for structured output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<serde_json::Value>,
}

/// Token accounting reported by the provider for one call.
///
/// `cached_tokens` is the subset of `prompt_tokens` served from the
/// provider's prompt cache at a discounted price.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    #[serde(default)]
    pub cached_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt: u64, completion: u64, cached: u64) -> Self {
        Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
            cached_tokens: cached.min(prompt),
            total_tokens: prompt + completion,
        }
    }
}

/// Successful endpoint response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub usage: TokenUsage,
}

/// Failure surfaced by the endpoint client.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub message: String,
    pub status: Option<u16>,
    /// Whether the client considers this failure transient.
    pub retryable: bool,
    /// Server-provided wait hint in seconds, when the client parsed one.
    pub retry_after: Option<f64>,
    /// Response headers, lowercased keys (e.g. `retry-after`).
    pub headers: HashMap<String, String>,
}

impl ApiError {
    /// A transient failure (network blip, 5xx) worth retrying in-call.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            retryable: true,
            retry_after: None,
            headers: HashMap::new(),
        }
    }

    /// A permanent failure (4xx other than 429) that should not be retried.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            retryable: false,
            retry_after: None,
            headers: HashMap::new(),
        }
    }

    /// A server-reported rate limit with an optional wait hint.
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<f64>) -> Self {
        Self {
            message: message.into(),
            status: Some(429),
            retryable: true,
            retry_after,
            headers: HashMap::new(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_lowercase(), value.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(|s| s.as_str())
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "api error (HTTP {}): {}", status, self.message),
            None => write!(f, "api error: {}", self.message),
        }
    }
}

impl std::error::Error for ApiError {}

/// The single operation the dispatcher core requires from a provider.
#[async_trait]
pub trait ChatEndpoint: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> std::result::Result<ChatResponse, ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_clamps_cached_to_prompt() {
        let usage = TokenUsage::new(50, 20, 80);
        assert_eq!(usage.cached_tokens, 50);
        assert_eq!(usage.total_tokens, 70);
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let err = ApiError::rate_limited("slow down", None).with_header("Retry-After", "7");
        assert_eq!(err.header("retry-after"), Some("7"));
        assert_eq!(err.header("RETRY-AFTER"), Some("7"));
    }

    #[test]
    fn test_display_includes_status() {
        let err = ApiError::permanent("bad request").with_status(400);
        assert_eq!(err.to_string(), "api error (HTTP 400): bad request");
    }
}
