//! Usage tracking via the UsageSink trait.
//!
//! The gateway reports every provider attempt through a UsageSink:
//! - the CLI uses TracingUsageSink
//! - tests use NoopUsageSink or a recording sink

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

/// Status of a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
        }
    }
}

/// Record of one provider attempt.
#[derive(Debug, Clone)]
pub struct ProviderCallRecord {
    pub endpoint: &'static str,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Cost in nanodollars (1e-9 USD).
    pub cost_nanodollars: i64,
    pub run_id: Option<Uuid>,
    pub latency_ms: u64,
    pub status: CallStatus,
    pub error_code: Option<&'static str>,
    /// Which code path made this call.
    pub caller: &'static str,
    pub request_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProviderCallRecord {
    pub fn new(endpoint: &'static str, model: impl Into<String>, caller: &'static str) -> Self {
        Self {
            endpoint,
            model: model.into(),
            input_tokens: 0,
            output_tokens: 0,
            cost_nanodollars: 0,
            run_id: None,
            latency_ms: 0,
            status: CallStatus::Success,
            error_code: None,
            caller,
            request_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn tokens(mut self, input: u32, output: u32) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn cost(mut self, nanodollars: i64) -> Self {
        self.cost_nanodollars = nanodollars;
        self
    }

    pub fn run(mut self, run_id: Option<Uuid>) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn error(mut self, code: &'static str) -> Self {
        self.status = CallStatus::Error;
        self.error_code = Some(code);
        self
    }

    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

/// Where usage records go.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Fire-and-forget: failures should be logged, not propagated.
    async fn record(&self, record: ProviderCallRecord);
}

/// Discards all records.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {}
}

/// Emits one structured tracing event per provider attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        let run_id = record.run_id.map(|id| id.to_string()).unwrap_or_default();
        match record.status {
            CallStatus::Success => info!(
                target: "valuate::usage",
                endpoint = record.endpoint,
                model = %record.model,
                caller = record.caller,
                run_id = %run_id,
                input_tokens = record.input_tokens,
                output_tokens = record.output_tokens,
                cost_nanos = record.cost_nanodollars,
                latency_ms = record.latency_ms,
                "provider call"
            ),
            CallStatus::Error => warn!(
                target: "valuate::usage",
                endpoint = record.endpoint,
                model = %record.model,
                caller = record.caller,
                run_id = %run_id,
                error_code = record.error_code.unwrap_or("provider_error"),
                request_id = record.request_id.as_deref().unwrap_or(""),
                "provider call failed"
            ),
        }
    }
}
