//! OpenAI-compatible chat completion client.
//!
//! Failures come back as [`ExecutionError`]s so a runner built on this client
//! can hand them straight to the optimizer, which scores them as zero.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ExecutionError, ExecutionErrorKind};

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// A single message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role of the message author: `"system"`, `"user"`, or `"assistant"`.
    pub role: String,
    /// The textual content of the message.
    pub content: String,
}

impl ChatMessage {
    /// Convenience constructor for a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Convenience constructor for a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// Convenience constructor for an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// A single completion choice returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    /// Zero-based index of this choice within the response.
    pub index: usize,
    /// The generated message.
    pub message: ChatMessage,
    /// The reason the model stopped generating (e.g. `"stop"`, `"length"`).
    pub finish_reason: Option<String>,
}

/// Token usage statistics for a request. Some compatible servers omit it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens consumed by the prompt.
    pub prompt_tokens: usize,
    /// Tokens generated in the completion.
    pub completion_tokens: usize,
    /// Total tokens (prompt + completion).
    pub total_tokens: usize,
}

/// A chat completion response from the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Unique identifier for this completion.
    pub id: String,
    /// The list of generated choices.
    pub choices: Vec<Choice>,
    /// Token usage statistics; zeroed when the server sends none.
    #[serde(default)]
    pub usage: Usage,
}

impl ChatResponse {
    /// Text of the first choice.
    pub fn content(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client for an OpenAI-compatible chat completions API.
///
/// Every call returns an [`ExecutionError`] on failure, classified by HTTP
/// status or transport failure. Retries are left to the caller.
#[derive(Debug, Clone)]
pub struct LlmClient {
    /// Base URL of the API, without a trailing slash
    /// (e.g. `"https://api.openai.com/v1"`).
    pub api_base: String,
    /// Bearer token sent with every request.
    pub api_key: String,
    /// Underlying HTTP client (120s request timeout).
    pub http: reqwest::Client,
}

impl LlmClient {
    /// Create a client for `base_url`. A trailing slash is stripped.
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("failed to build reqwest client")?;

        Ok(Self {
            api_base: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            http,
        })
    }

    /// Send a chat completion request.
    ///
    /// Calls `POST {base_url}/chat/completions`. Non-2xx statuses map to
    /// [`ExecutionErrorKind`]s: 429 is rate limiting, 408/504 a timeout,
    /// 503 an open circuit, anything else a provider error.
    pub async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: usize,
    ) -> Result<ChatResponse, ExecutionError> {
        let url = format!("{}/chat/completions", self.api_base);
        debug!(model, temperature, max_tokens, messages = messages.len(), "sending chat completion request");

        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "temperature": temperature,
            "max_tokens": max_tokens,
        });

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ExecutionError::new(
                status_kind(status),
                format!("chat completion API returned {status}: {text}"),
            ));
        }

        let chat_response: ChatResponse = resp.json().await.map_err(|e| {
            ExecutionError::new(
                ExecutionErrorKind::InvalidResponse,
                format!("failed to parse chat completion response: {e}"),
            )
        })?;

        debug!(
            model,
            prompt_tokens = chat_response.usage.prompt_tokens,
            completion_tokens = chat_response.usage.completion_tokens,
            "chat completion succeeded"
        );
        Ok(chat_response)
    }

    /// Send `messages` and return the first choice's text.
    pub async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: usize,
    ) -> Result<String, ExecutionError> {
        let resp = self
            .chat_completion(model, messages, temperature, max_tokens)
            .await?;
        resp.content().map(str::to_string).ok_or_else(|| {
            ExecutionError::new(ExecutionErrorKind::InvalidResponse, "response has no choices")
        })
    }
}

fn status_kind(status: StatusCode) -> ExecutionErrorKind {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ExecutionErrorKind::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ExecutionErrorKind::Timeout,
        StatusCode::SERVICE_UNAVAILABLE => ExecutionErrorKind::CircuitOpen,
        _ => ExecutionErrorKind::ProviderError,
    }
}

fn transport_error(error: reqwest::Error) -> ExecutionError {
    let kind = if error.is_timeout() {
        ExecutionErrorKind::Timeout
    } else {
        ExecutionErrorKind::NetworkError
    };
    ExecutionError::new(kind, format!("failed to send chat completion request: {error}"))
}
