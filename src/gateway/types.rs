//! Request and response types shared by the gateway adapters.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// ATTRIBUTION
// =============================================================================

/// Who asked for a provider call.
///
/// Generation and embedding calls made on behalf of an evaluation carry its id
/// so usage records can be grouped per prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct Attribution {
    /// Evaluation this call belongs to, if any.
    pub evaluation_id: Option<Uuid>,
    /// Static code path label, e.g. "generation::chat" or "similarity::embed".
    pub caller: &'static str,
}

impl Attribution {
    pub fn new(caller: &'static str) -> Self {
        Self {
            caller,
            ..Default::default()
        }
    }

    pub fn with_evaluation(mut self, evaluation_id: Uuid) -> Self {
        self.evaluation_id = Some(evaluation_id);
        self
    }

    /// Tag with the evaluation running on the current task, if any.
    pub fn in_current_evaluation(self) -> Self {
        match current_evaluation() {
            Some(id) => self.with_evaluation(id),
            None => self,
        }
    }
}

tokio::task_local! {
    static EVALUATION_ID: Uuid;
}

/// Run `fut` with `id` as the current evaluation. Provider calls made inside
/// it, including from concurrently polled sub-futures, pick the id up through
/// [`Attribution::in_current_evaluation`].
pub async fn scope_evaluation<F: Future>(id: Uuid, fut: F) -> F::Output {
    EVALUATION_ID.scope(id, fut).await
}

/// Id set by the innermost enclosing [`scope_evaluation`].
pub fn current_evaluation() -> Option<Uuid> {
    EVALUATION_ID.try_with(|id| *id).ok()
}

// =============================================================================
// CHAT TYPES
// =============================================================================

/// Chat message role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
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
}

/// Request for chat completion.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Provider model id, e.g. "openai/gpt-4o-mini".
    pub model: String,
    pub messages: Vec<Message>,
    /// Sampling temperature (0.0 - 2.0). Repeated sampling needs this above zero.
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
    pub latency: Duration,
    pub finish_reason: FinishReason,
}

// =============================================================================
// EMBEDDING TYPES
// =============================================================================

/// Request to embed texts. Each text produces one vector, in input order.
#[derive(Debug, Clone)]
pub struct EmbedRequest {
    pub model: String,
    pub texts: Vec<String>,
    pub attribution: Attribution,
}

impl EmbedRequest {
    pub fn new(model: impl Into<String>, texts: Vec<String>, attribution: Attribution) -> Self {
        Self {
            model: model.into(),
            texts,
            attribution,
        }
    }
}

/// Response from an embedding request.
#[derive(Debug, Clone)]
pub struct EmbedResponse {
    pub embeddings: Vec<Vec<f32>>,
    pub input_tokens: u32,
    pub latency: Duration,
}
