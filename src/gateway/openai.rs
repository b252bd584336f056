//! Adapter for OpenAI-compatible `/chat/completions` endpoints.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::pricing::chat_cost;
use super::types::*;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

const PROVIDER: &str = "openai";

// =============================================================================
// TRAIT
// =============================================================================

/// A single-shot chat completion backend, without retries.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

// =============================================================================
// ADAPTER
// =============================================================================

/// Maximum allowed response body length (1MB).
const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

/// Maximum allowed input characters (~125k tokens).
const MAX_INPUT_CHARS: usize = 500_000;

#[derive(Debug, Clone)]
pub struct OpenAiAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl OpenAiAdapter {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_config(api_key, DEFAULT_BASE_URL, DEFAULT_TIMEOUT)
    }

    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ProviderError::config("API key is empty"));
        }
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let auth_value = HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
            .map_err(|_| ProviderError::config("Invalid API key format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn extract_request_id(headers: &HeaderMap) -> Option<String> {
        headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    fn is_refusal(msg: &str) -> bool {
        let l = msg.trim_start().to_lowercase();
        l.contains("content policy") || l.contains("request was refused")
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ChatApiResponse {
    choices: Option<Vec<Choice>>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
    code: Option<String>,
}

fn truncate_on_char_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

// =============================================================================
// CHAT PROVIDER IMPL
// =============================================================================

#[async_trait]
impl ChatProvider for OpenAiAdapter {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let total_chars = req.input_chars();
        if total_chars > MAX_INPUT_CHARS {
            return Err(ProviderError::invalid_request(format!(
                "Input too large: {total_chars} chars (max {MAX_INPUT_CHARS})"
            )));
        }

        let start = Instant::now();

        let api_req = ChatApiRequest {
            model: &req.model,
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
        };

        let mut response = self
            .client
            .post(self.chat_url())
            .json(&api_req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(start.elapsed())
                } else {
                    ProviderError::Http(e)
                }
            })?;

        let status = response.status();
        let request_id = Self::extract_request_id(response.headers());

        // Stream response to enforce size limit
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let new_len = bytes.len() + chunk.len();
            if new_len > MAX_RESPONSE_LEN {
                return Err(ProviderError::provider(
                    PROVIDER,
                    format!("Response too large: {new_len} bytes"),
                    false,
                ));
            }
            bytes.extend_from_slice(&chunk);
        }

        let body = String::from_utf8_lossy(&bytes).to_string();

        let ctx = ErrorContext::new().with_status(status.as_u16());
        let ctx = match &request_id {
            Some(id) => ctx.with_request_id(id),
            None => ctx,
        };

        if !status.is_success() {
            let parsed_error = serde_json::from_str::<ChatApiResponse>(&body)
                .ok()
                .and_then(|p| p.error);
            let (message, ctx) = match parsed_error {
                Some(error) => {
                    let ctx = match error.code {
                        Some(code) => ctx.with_code(code),
                        None => ctx,
                    };
                    (error.message.unwrap_or_default(), ctx)
                }
                None => (format!("HTTP {}", status.as_u16()), ctx),
            };

            return Err(match status.as_u16() {
                401 | 403 => ProviderError::unauthorized(message, ctx),
                429 => ProviderError::rate_limited(Duration::from_secs(60), ctx),
                code => ProviderError::provider_with_context(PROVIDER, message, code >= 500, ctx),
            });
        }

        let parsed: ChatApiResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::provider(PROVIDER, format!("Invalid JSON: {e}"), false))?;

        if let Some(error) = parsed.error {
            let message = error.message.unwrap_or_default();
            if Self::is_refusal(&message) {
                return Err(ProviderError::refused(message));
            }
            return Err(ProviderError::provider(PROVIDER, message, false));
        }

        let choice = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| ProviderError::provider(PROVIDER, "No choices in response", false))?;

        let finish_reason = FinishReason::from(choice.finish_reason);
        if finish_reason == FinishReason::ContentFilter {
            return Err(ProviderError::refused("completion stopped by content filter"));
        }

        let mut content = choice
            .message
            .and_then(|m| m.content)
            .unwrap_or_default();
        truncate_on_char_boundary(&mut content, MAX_RESPONSE_LEN);

        let (input_tokens, output_tokens) = parsed
            .usage
            .map(|u| {
                (
                    u.prompt_tokens.unwrap_or(0),
                    u.completion_tokens.unwrap_or(0),
                )
            })
            .unwrap_or((0, 0));

        Ok(ChatResponse {
            content,
            input_tokens,
            output_tokens,
            cost_nanodollars: chat_cost(&req.model, input_tokens, output_tokens),
            latency: start.elapsed(),
            finish_reason,
        })
    }
}
