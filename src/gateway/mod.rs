//! Provider gateway for the external collaborators: text generation and embeddings.

pub mod error;
pub mod openrouter;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use openrouter::{ChatProvider, EmbedProvider, OpenRouterAdapter};
use usage::ProviderCallRecord;

pub use error::{ErrorContext, ProviderError};
pub use types::*;
pub use usage::{CallStatus, NoopUsageSink, TracingUsageSink, UsageSink};

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[async_trait::async_trait]
pub trait EmbedGateway: Send + Sync {
    async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError>;
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

/// OpenRouter adapter plus retry policy and usage accounting.
pub struct ProviderGateway<U: UsageSink> {
    openrouter: OpenRouterAdapter,
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl<U: UsageSink> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

#[async_trait::async_trait]
impl<U: UsageSink> EmbedGateway for ProviderGateway<U> {
    async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        ProviderGateway::embed(self, req).await
    }
}

impl<U: UsageSink> ProviderGateway<U> {
    pub fn from_env(usage_sink: Arc<U>) -> Result<Self, ProviderError> {
        let openrouter = OpenRouterAdapter::from_env()?;
        Ok(Self {
            openrouter,
            usage_sink,
            config: GatewayConfig::default(),
        })
    }

    pub fn with_config(
        openrouter: OpenRouterAdapter,
        usage_sink: Arc<U>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            openrouter,
            usage_sink,
            config,
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut attempt = 0;
        loop {
            match self.openrouter.chat(&req).await {
                Ok(resp) => {
                    let record = self
                        .record_base("chat/completions", &req.model, req.attribution)
                        .tokens(resp.input_tokens, resp.output_tokens)
                        .latency(resp.latency.as_millis() as u64);
                    self.usage_sink.record(record).await;
                    return Ok(resp);
                }
                Err(err) => {
                    let record = self
                        .record_base("chat/completions", &req.model, req.attribution)
                        .error(err.code());
                    self.usage_sink.record(record).await;

                    if !err.is_retryable() || attempt == self.config.max_retries {
                        return Err(err);
                    }
                    tracing::debug!(attempt, error = %err, "retrying chat completion");
                    sleep(backoff_delay(self.config.retry_base_delay, attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    pub async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        let mut attempt = 0;
        loop {
            match self.openrouter.embed(&req).await {
                Ok(resp) => {
                    let record = self
                        .record_base("embeddings", &req.model, req.attribution)
                        .tokens(resp.input_tokens, 0)
                        .latency(resp.latency.as_millis() as u64);
                    self.usage_sink.record(record).await;
                    return Ok(resp);
                }
                Err(err) => {
                    let record = self
                        .record_base("embeddings", &req.model, req.attribution)
                        .error(err.code());
                    self.usage_sink.record(record).await;

                    if !err.is_retryable() || attempt == self.config.max_retries {
                        return Err(err);
                    }
                    tracing::debug!(attempt, error = %err, "retrying embedding request");
                    sleep(backoff_delay(self.config.retry_base_delay, attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    fn record_base(
        &self,
        endpoint: &'static str,
        model: &str,
        attribution: Attribution,
    ) -> ProviderCallRecord {
        ProviderCallRecord::new("openrouter", endpoint, model, attribution.caller)
            .evaluation(attribution.evaluation_id)
    }
}

/// Exponential backoff: `base * 2^attempt`, with the exponent capped at 5.
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u32.pow(attempt.min(5));
    base * multiplier
}
