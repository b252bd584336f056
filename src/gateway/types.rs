//! Core types for the provider gateway.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// ATTRIBUTION
// =============================================================================

/// Attribution for cost tracking and debugging.
///
/// Every request carries the run it belongs to and the code path that made it,
/// e.g. "peers::weights" or "qa::questions".
#[derive(Debug, Clone, Default)]
pub struct Attribution {
    pub run_id: Option<Uuid>,
    pub caller: &'static str,
}

impl Attribution {
    pub fn new(caller: &'static str) -> Self {
        Self {
            caller,
            ..Default::default()
        }
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

// =============================================================================
// CHAT TYPES
// =============================================================================

/// Chat message role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Request for chat completion.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Provider model id, e.g. "gpt-4".
    pub model: String,
    pub messages: Vec<Message>,
    /// Sampling temperature (0.0 - 2.0).
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub attribution: Attribution,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>, attribution: Attribution) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.0,
            max_tokens: None,
            attribution,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    /// Total characters across all messages.
    pub fn input_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.len()).sum()
    }
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Unknown(String),
}

impl From<Option<String>> for FinishReason {
    fn from(s: Option<String>) -> Self {
        match s.as_deref() {
            Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            Some(other) => FinishReason::Unknown(other.to_string()),
            None => FinishReason::Unknown("none".to_string()),
        }
    }
}

/// Response from chat completion.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Cost in nanodollars (1e-9 USD), from the local pricing table.
    pub cost_nanodollars: i64,
    pub latency: Duration,
    pub finish_reason: FinishReason,
}

impl ChatResponse {
    /// Response carrying only content, for test doubles and cache hits.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            input_tokens: 0,
            output_tokens: 0,
            cost_nanodollars: 0,
            latency: Duration::ZERO,
            finish_reason: FinishReason::Stop,
        }
    }
}
