//! Error types for the provider gateway.

use std::time::Duration;
use thiserror::Error;

/// Additional context from provider errors for debugging.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// HTTP status code from the provider.
    pub http_status: Option<u16>,
    /// Provider-specific error code (e.g. "invalid_api_key").
    pub provider_code: Option<String>,
    /// Request ID from provider (x-request-id header).
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.provider_code = Some(code.into());
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

/// Errors that can occur when calling the text-generation provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Credential missing or rejected - fatal for the whole run.
    #[error("unauthorized: {message}")]
    Unauthorized {
        message: String,
        context: Option<ErrorContext>,
    },

    /// Provider returned 429 - caller should retry after the specified duration.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        retry_after: Duration,
        context: Option<ErrorContext>,
    },

    /// Invalid request - permanent error, don't retry.
    #[error("invalid request: {message}")]
    InvalidRequest {
        message: String,
        context: Option<ErrorContext>,
    },

    /// Provider refused the request (content policy, etc.) - permanent error.
    #[error("refused: {message}")]
    Refused {
        message: String,
        context: Option<ErrorContext>,
    },

    /// Provider error - may be retryable.
    #[error("{provider} error: {message}")]
    Provider {
        provider: &'static str,
        message: String,
        retryable: bool,
        context: Option<ErrorContext>,
    },

    /// Request timed out - retryable.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// HTTP/network error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error (missing API key, etc.).
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn unauthorized(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::Unauthorized {
            message: message.into(),
            context: Some(context),
        }
    }

    pub fn rate_limited(retry_after: Duration, context: ErrorContext) -> Self {
        Self::RateLimited {
            retry_after,
            context: Some(context),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            context: None,
        }
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self::Refused {
            message: message.into(),
            context: None,
        }
    }

    pub fn provider(provider: &'static str, message: impl Into<String>, retryable: bool) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
            retryable,
            context: None,
        }
    }

    pub fn provider_with_context(
        provider: &'static str,
        message: impl Into<String>,
        retryable: bool,
        context: ErrorContext,
    ) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
            retryable,
            context: Some(context),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Timeout(_) => true,
            Self::Provider { retryable, .. } => *retryable,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Unauthorized { .. } => false,
            Self::InvalidRequest { .. } => false,
            Self::Refused { .. } => false,
            Self::Config(_) => false,
        }
    }

    /// Credential problems end the run no matter which stage hit them.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized { .. } | Self::Config(_))
    }

    /// Short error code for logging.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "unauthorized",
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Refused { .. } => "refused",
            Self::Provider { .. } => "provider_error",
            Self::Timeout(_) => "timeout",
            Self::Http(_) => "http_error",
            Self::Config(_) => "config_error",
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::Unauthorized { context, .. } => context.as_ref(),
            Self::RateLimited { context, .. } => context.as_ref(),
            Self::InvalidRequest { context, .. } => context.as_ref(),
            Self::Refused { context, .. } => context.as_ref(),
            Self::Provider { context, .. } => context.as_ref(),
            Self::Timeout(_) => None,
            Self::Http(_) => None,
            Self::Config(_) => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.context().and_then(|c| c.request_id.as_deref())
    }
}
