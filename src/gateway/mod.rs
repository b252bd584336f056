//! Provider gateway for OpenAI-compatible chat completions.

pub mod error;
pub mod openai;
pub mod pricing;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use usage::ProviderCallRecord;

pub use error::{ErrorContext, ProviderError};
pub use openai::{ChatProvider, OpenAiAdapter};
pub use pricing::chat_cost;
pub use types::*;
pub use usage::{NoopUsageSink, TracingUsageSink, UsageSink};

/// The text-generation seam every stage talks to.
#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[async_trait::async_trait]
impl<G: ChatGateway + ?Sized> ChatGateway for Arc<G> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        (**self).chat(req).await
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

/// Retries retryable provider errors with exponential backoff and reports
/// every attempt to a [`UsageSink`].
pub struct ProviderGateway<P: ChatProvider, U: UsageSink> {
    provider: P,
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl<P: ChatProvider, U: UsageSink> ChatGateway for ProviderGateway<P, U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl<P: ChatProvider, U: UsageSink> ProviderGateway<P, U> {
    pub fn new(provider: P, usage_sink: Arc<U>) -> Self {
        Self::with_config(provider, usage_sink, GatewayConfig::default())
    }

    pub fn with_config(provider: P, usage_sink: Arc<U>, config: GatewayConfig) -> Self {
        Self {
            provider,
            usage_sink,
            config,
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut last_error: Option<ProviderError> = None;

        for attempt in 0..=self.config.max_retries {
            match self.provider.chat(&req).await {
                Ok(resp) => {
                    self.record_usage(&req, Some(&resp), None).await;
                    return Ok(resp);
                }
                Err(err) => {
                    self.record_usage(&req, None, Some(&err)).await;

                    if !err.is_retryable() || attempt == self.config.max_retries {
                        return Err(err);
                    }

                    let delay = match &err {
                        ProviderError::RateLimited { retry_after, .. } => {
                            (*retry_after).min(backoff_delay(self.config.retry_base_delay, 5))
                        }
                        _ => backoff_delay(self.config.retry_base_delay, attempt),
                    };
                    warn!(
                        caller = req.attribution.caller,
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "retrying provider call"
                    );
                    last_error = Some(err);
                    sleep(delay).await;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ProviderError::provider("gateway", "unknown error", false)))
    }

    async fn record_usage(
        &self,
        req: &ChatRequest,
        resp: Option<&ChatResponse>,
        err: Option<&ProviderError>,
    ) {
        let mut record = ProviderCallRecord::new(
            "chat/completions",
            req.model.clone(),
            req.attribution.caller,
        )
        .run(req.attribution.run_id);

        if let Some(resp) = resp {
            record = record
                .tokens(resp.input_tokens, resp.output_tokens)
                .cost(resp.cost_nanodollars)
                .latency(resp.latency.as_millis() as u64);
        }
        if let Some(err) = err {
            record = record.error(err.code());
            if let Some(id) = err.request_id() {
                record = record.request_id(id);
            }
        }

        self.usage_sink.record(record).await;
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u64.pow(attempt.min(5));
    base * multiplier as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use super::usage::CallStatus;

    struct Flaky {
        failures: AtomicU32,
        error: fn() -> ProviderError,
    }

    #[async_trait]
    impl ChatProvider for Flaky {
        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err((self.error)());
            }
            Ok(ChatResponse::text("ok"))
        }
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<ProviderCallRecord>>);

    #[async_trait]
    impl UsageSink for Recording {
        async fn record(&self, record: ProviderCallRecord) {
            self.0.lock().unwrap().push(record);
        }
    }

    fn config() -> GatewayConfig {
        GatewayConfig {
            max_retries: 2,
            retry_base_delay: Duration::from_millis(1),
        }
    }

    fn request() -> ChatRequest {
        ChatRequest::new("gpt-4", vec![Message::user("hi")], Attribution::new("test"))
    }

    #[tokio::test]
    async fn retries_transient_errors_then_succeeds() {
        let sink = Arc::new(Recording::default());
        let gateway = ProviderGateway::with_config(
            Flaky {
                failures: AtomicU32::new(2),
                error: || ProviderError::provider("openai", "overloaded", true),
            },
            sink.clone(),
            config(),
        );
        let resp = gateway.chat(request()).await.unwrap();
        assert_eq!(resp.content, "ok");

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].status, CallStatus::Error);
        assert_eq!(records[2].status, CallStatus::Success);
    }

    #[tokio::test]
    async fn unauthorized_is_not_retried() {
        let sink = Arc::new(Recording::default());
        let gateway = ProviderGateway::with_config(
            Flaky {
                failures: AtomicU32::new(5),
                error: || ProviderError::unauthorized("bad key", ErrorContext::new()),
            },
            sink.clone(),
            config(),
        );
        let err = gateway.chat(request()).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let gateway = ProviderGateway::with_config(
            Flaky {
                failures: AtomicU32::new(10),
                error: || ProviderError::Timeout(Duration::from_secs(1)),
            },
            Arc::new(NoopUsageSink),
            config(),
        );
        let err = gateway.chat(request()).await.unwrap_err();
        assert_eq!(err.code(), "timeout");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, 9), Duration::from_millis(3200));
    }
}
