//! Usage tracking via the UsageSink trait.
//!
//! Repeated sampling is the expensive part of an evaluation, so every provider
//! call is reported to a sink. Callers pick where records go:
//! - `NoopUsageSink` for tests
//! - `TracingUsageSink` to emit one structured event per call
//! - their own implementation for persistent accounting

use async_trait::async_trait;
use chrono::{DateTime, Utc};
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

/// Record of a provider API call.
#[derive(Debug, Clone)]
pub struct ProviderCallRecord {
    /// Provider name, e.g. "openrouter".
    pub provider: &'static str,
    /// Endpoint: "chat/completions" or "embeddings".
    pub endpoint: &'static str,
    pub model: String,
    pub input_tokens: u32,
    /// Zero for embeddings.
    pub output_tokens: u32,
    pub evaluation_id: Option<Uuid>,
    pub latency_ms: u64,
    pub status: CallStatus,
    pub error_code: Option<String>,
    /// Which code path made this call.
    pub caller: &'static str,
    pub timestamp: DateTime<Utc>,
}

impl ProviderCallRecord {
    pub fn new(
        provider: &'static str,
        endpoint: &'static str,
        model: impl Into<String>,
        caller: &'static str,
    ) -> Self {
        Self {
            provider,
            endpoint,
            model: model.into(),
            input_tokens: 0,
            output_tokens: 0,
            evaluation_id: None,
            latency_ms: 0,
            status: CallStatus::Success,
            error_code: None,
            caller,
            timestamp: Utc::now(),
        }
    }

    pub fn tokens(mut self, input: u32, output: u32) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn evaluation(mut self, evaluation_id: Option<Uuid>) -> Self {
        self.evaluation_id = evaluation_id;
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn error(mut self, code: impl Into<String>) -> Self {
        self.status = CallStatus::Error;
        self.error_code = Some(code.into());
        self
    }
}

/// Sink for provider call records.
///
/// Recording is fire-and-forget: implementations log their own failures
/// instead of propagating them into the evaluation.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: ProviderCallRecord);
}

/// Discards all records.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {}
}

/// Emits each record as a `tracing` event on the `eva_harness::usage` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        tracing::info!(
            target: "eva_harness::usage",
            provider = record.provider,
            endpoint = record.endpoint,
            model = %record.model,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            latency_ms = record.latency_ms,
            status = record.status.as_str(),
            error_code = record.error_code.as_deref().unwrap_or(""),
            caller = record.caller,
            evaluation_id = ?record.evaluation_id,
            "provider call"
        );
    }
}
