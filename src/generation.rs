//! Text generation collaborator and the bounded-parallel sampler.
//!
//! Generation calls for one prompt are independent, so a batch is issued
//! through `buffer_unordered` with a configured width. Outputs are appended
//! to the caller's [`SampleSet`] as they complete; if the batch future is
//! dropped (timeout), every sample that already finished is kept.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::gateway::{backoff_delay, Attribution, ChatGateway, ChatRequest, Message, ProviderError};

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    /// Final error from a provider gateway, after its own retries.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("generation failed: {message}")]
    Failed { message: String, retryable: bool },
}

impl GenerationError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether the sampler should try the call again.
    ///
    /// Provider errors never are: the gateway that produced them already ran
    /// its retry loop, and `max_generation_retries` must stay the bound.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(_) => false,
            Self::Failed { retryable, .. } => *retryable,
        }
    }
}

/// Produces one output for a prompt. May be nondeterministic.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;

    /// Whether concurrent calls are safe. When false the evaluator serializes calls.
    fn supports_concurrency(&self) -> bool {
        true
    }
}

type GenerateFn = dyn Fn(&str) -> Result<String, GenerationError> + Send + Sync;

/// Adapts a synchronous closure into a [`Generator`].
pub struct FnGenerator {
    f: Box<GenerateFn>,
    concurrent: bool,
}

impl FnGenerator {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        Self::fallible(move |prompt| Ok(f(prompt)))
    }

    pub fn fallible<F>(f: F) -> Self
    where
        F: Fn(&str) -> Result<String, GenerationError> + Send + Sync + 'static,
    {
        Self {
            f: Box::new(f),
            concurrent: true,
        }
    }

    /// Mark the closure as unsafe to call concurrently.
    pub fn serialized(mut self) -> Self {
        self.concurrent = false;
        self
    }
}

#[async_trait]
impl Generator for FnGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        (self.f)(prompt)
    }

    fn supports_concurrency(&self) -> bool {
        self.concurrent
    }
}

/// Generation through a chat model behind a [`ChatGateway`].
pub struct ChatGenerator<G: ChatGateway> {
    gateway: Arc<G>,
    model: String,
    temperature: f32,
    system_prompt: Option<String>,
    max_tokens: Option<u32>,
}

/// Repeated sampling is pointless at temperature 0.
const DEFAULT_SAMPLING_TEMPERATURE: f32 = 0.7;

impl<G: ChatGateway> ChatGenerator<G> {
    pub fn new(gateway: Arc<G>, model: impl Into<String>) -> Self {
        Self {
            gateway,
            model: model.into(),
            temperature: DEFAULT_SAMPLING_TEMPERATURE,
            system_prompt: None,
            max_tokens: None,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }
}

#[async_trait]
impl<G: ChatGateway> Generator for ChatGenerator<G> {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.system_prompt {
            messages.push(Message::system(system.clone()));
        }
        messages.push(Message::user(prompt));

        let mut req = ChatRequest::new(
            self.model.clone(),
            messages,
            Attribution::new("generation::chat").in_current_evaluation(),
        )
        .temperature(self.temperature);
        if let Some(max) = self.max_tokens {
            req = req.max_tokens(max);
        }

        let resp = self.gateway.chat(req).await?;
        Ok(resp.content)
    }
}

/// Serializes calls into a generator that is not safe to call concurrently.
pub struct SerializedGenerator {
    gate: Mutex<()>,
    inner: Arc<dyn Generator>,
}

impl SerializedGenerator {
    pub fn new(inner: Arc<dyn Generator>) -> Self {
        Self {
            gate: Mutex::new(()),
            inner,
        }
    }
}

#[async_trait]
impl Generator for SerializedGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let _guard = self.gate.lock().await;
        self.inner.generate(prompt).await
    }
}

// =============================================================================
// Sampler
// =============================================================================

/// Successful outputs plus the count of calls that failed after retries.
#[derive(Debug, Clone, Default)]
pub struct SampleSet {
    pub outputs: Vec<String>,
    pub failures: usize,
    pub last_error: Option<String>,
}

impl SampleSet {
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

/// Counts for one `draw` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub requested: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchOutcome {
    /// Every requested call failed (an empty request never counts as failed).
    pub fn all_failed(&self) -> bool {
        self.requested > 0 && self.succeeded == 0
    }
}

pub struct Sampler {
    generator: Arc<dyn Generator>,
    concurrency: usize,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl Sampler {
    /// Wraps non-concurrent generators in a [`SerializedGenerator`].
    pub fn new(
        generator: Arc<dyn Generator>,
        concurrency: usize,
        max_retries: u32,
        retry_base_delay: Duration,
    ) -> Self {
        let generator: Arc<dyn Generator> = if generator.supports_concurrency() {
            generator
        } else {
            Arc::new(SerializedGenerator::new(generator))
        };
        Self {
            generator,
            concurrency: concurrency.max(1),
            max_retries,
            retry_base_delay,
        }
    }

    /// Draw `n` samples of the same prompt into `set`.
    pub async fn draw(&self, prompt: &str, n: usize, set: &mut SampleSet) -> BatchOutcome {
        self.draw_each(std::iter::repeat(prompt.to_string()).take(n).collect(), set)
            .await
    }

    /// Draw one sample per prompt into `set`. Completion order, not input order.
    pub async fn draw_each(&self, prompts: Vec<String>, set: &mut SampleSet) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            requested: prompts.len(),
            ..Default::default()
        };

        let mut results = stream::iter(
            prompts
                .into_iter()
                .map(|prompt| async move { self.generate_with_retry(&prompt).await }),
        )
        .buffer_unordered(self.concurrency);

        while let Some(result) = results.next().await {
            match result {
                Ok(text) => {
                    set.outputs.push(text);
                    outcome.succeeded += 1;
                }
                Err(err) => {
                    warn!(error = %err, "Dropping sample after generation failure");
                    set.failures += 1;
                    set.last_error = Some(err.to_string());
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }

    async fn generate_with_retry(&self, prompt: &str) -> Result<String, GenerationError> {
        let mut attempt = 0;
        loop {
            match self.generator.generate(prompt).await {
                Ok(text) => return Ok(text),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    debug!(attempt, error = %err, "retrying generation");
                    sleep(backoff_delay(self.retry_base_delay, attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
