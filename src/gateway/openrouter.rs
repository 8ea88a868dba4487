//! OpenRouter adapter for chat completions and embeddings.
//!
//! Both endpoints follow the OpenAI wire format, so the same adapter also
//! works against any compatible base URL.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::types::*;

// =============================================================================
// TRAITS
// =============================================================================

/// Raw chat completion provider (no retries, no usage accounting).
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// Raw embedding provider (no retries, no usage accounting).
#[async_trait]
pub trait EmbedProvider: Send + Sync {
    async fn embed(&self, req: &EmbedRequest) -> Result<EmbedResponse, ProviderError>;
}

// =============================================================================
// OPENROUTER ADAPTER
// =============================================================================

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Maximum allowed response body (4MB; embedding batches are larger than chat replies).
const MAX_RESPONSE_LEN: usize = 4 * 1_024 * 1_024;

/// Maximum allowed input characters per request.
const MAX_INPUT_CHARS: usize = 500_000;

#[derive(Debug, Clone)]
pub struct OpenRouterAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl OpenRouterAdapter {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_config(api_key, DEFAULT_BASE_URL, Duration::from_secs(120))
    }

    /// Reads `OPENROUTER_API_KEY`, `OPENROUTER_BASE_URL` and `OPENROUTER_TIMEOUT_SECONDS`.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| ProviderError::config("OPENROUTER_API_KEY not set"))?;

        let base_url =
            std::env::var("OPENROUTER_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());

        let timeout = std::env::var("OPENROUTER_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(120));

        Self::with_config(api_key, base_url, timeout)
    }

    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth_value = HeaderValue::from_str(&format!("Bearer {api_key}"))
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

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{endpoint}", self.base_url)
    }

    fn extract_request_id(headers: &HeaderMap) -> Option<String> {
        headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    fn is_refusal(msg: &str) -> bool {
        let l = msg.trim_start().to_lowercase();
        let first_line = l.lines().next().unwrap_or("");

        const PREFIXES: &[&str] = &[
            "i cannot",
            "i can't",
            "i won't",
            "i will not",
            "i am unable to",
            "i'm unable to",
            "unable to comply",
            "unable to assist",
        ];

        PREFIXES.iter().any(|p| first_line.starts_with(p)) || l.contains("request was refused")
    }

    /// POST a JSON body and return the size-capped response text.
    ///
    /// Non-2xx statuses are mapped to `ProviderError` here so both endpoints
    /// classify rate limits and server errors the same way.
    async fn post_json<T: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &T,
    ) -> Result<String, ProviderError> {
        let mut response = self.client.post(self.url(endpoint)).json(body).send().await?;

        let status = response.status();
        let request_id = Self::extract_request_id(response.headers());

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let new_len = bytes.len() + chunk.len();
            if new_len > MAX_RESPONSE_LEN {
                return Err(ProviderError::malformed(format!(
                    "response too large: {new_len} bytes"
                )));
            }
            bytes.extend_from_slice(&chunk);
        }
        let text = String::from_utf8_lossy(&bytes).to_string();

        if status.is_success() {
            return Ok(text);
        }

        let mut ctx = ErrorContext::for_status(status.as_u16());
        if let Some(id) = &request_id {
            ctx = ctx.with_request_id(id);
        }

        let mut message = format!("HTTP {}", status.as_u16());
        if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&text) {
            if let Some(error) = envelope.error {
                if let Some(code) = error.code {
                    ctx = ctx.with_code(match code {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    });
                }
                if let Some(msg) = error.message {
                    message = msg;
                }
            }
        }

        Err(ProviderError::from_status(status.as_u16(), message, ctx))
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

#[derive(Serialize)]
struct EmbedApiRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedApiResponse {
    data: Option<Vec<EmbeddingDatum>>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
    /// OpenRouter sends numeric codes; OpenAI-compatible servers send strings.
    code: Option<serde_json::Value>,
}

// =============================================================================
// PROVIDER IMPLS
// =============================================================================

#[async_trait]
impl ChatProvider for OpenRouterAdapter {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let total_chars: usize = req.messages.iter().map(|m| m.content.len()).sum();
        if total_chars > MAX_INPUT_CHARS {
            return Err(ProviderError::InputTooLarge {
                chars: total_chars,
                limit: MAX_INPUT_CHARS,
            });
        }

        let start = Instant::now();
        let api_req = ChatApiRequest {
            model: &req.model,
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
        };
        let body = self.post_json("chat/completions", &api_req).await?;

        let parsed: ChatApiResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::malformed(format!("invalid JSON: {e}")))?;

        if let Some(error) = parsed.error {
            let message = error.message.unwrap_or_default();
            if Self::is_refusal(&message) {
                return Err(ProviderError::Refused(message));
            }
            return Err(ProviderError::Api { message });
        }

        let choice = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| ProviderError::malformed("no choices in response"))?;

        let content = choice
            .message
            .and_then(|m| m.content)
            .unwrap_or_default();
        if Self::is_refusal(&content) {
            return Err(ProviderError::Refused(content));
        }

        let usage = parsed.usage;
        Ok(ChatResponse {
            content,
            input_tokens: usage.as_ref().and_then(|u| u.prompt_tokens).unwrap_or(0),
            output_tokens: usage.as_ref().and_then(|u| u.completion_tokens).unwrap_or(0),
            latency: start.elapsed(),
            finish_reason: FinishReason::from(choice.finish_reason),
        })
    }
}

#[async_trait]
impl EmbedProvider for OpenRouterAdapter {
    async fn embed(&self, req: &EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        if req.texts.is_empty() {
            return Ok(EmbedResponse {
                embeddings: Vec::new(),
                input_tokens: 0,
                latency: Duration::ZERO,
            });
        }
        let total_chars: usize = req.texts.iter().map(|t| t.len()).sum();
        if total_chars > MAX_INPUT_CHARS {
            return Err(ProviderError::InputTooLarge {
                chars: total_chars,
                limit: MAX_INPUT_CHARS,
            });
        }

        let start = Instant::now();
        let api_req = EmbedApiRequest {
            model: &req.model,
            input: &req.texts,
        };
        let body = self.post_json("embeddings", &api_req).await?;

        let parsed: EmbedApiResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::malformed(format!("invalid JSON: {e}")))?;

        if let Some(error) = parsed.error {
            return Err(ProviderError::Api {
                message: error.message.unwrap_or_default(),
            });
        }

        let mut data = parsed
            .data
            .ok_or_else(|| ProviderError::malformed("no data in response"))?;
        if data.len() != req.texts.len() {
            return Err(ProviderError::malformed(format!(
                "expected {} embeddings, got {}",
                req.texts.len(),
                data.len()
            )));
        }
        // Providers may return items out of order; `index` is authoritative when present.
        data.sort_by_key(|d| d.index.unwrap_or(usize::MAX));

        Ok(EmbedResponse {
            embeddings: data.into_iter().map(|d| d.embedding).collect(),
            input_tokens: parsed.usage.and_then(|u| u.prompt_tokens).unwrap_or(0),
            latency: start.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refusal_detection_checks_first_line_prefixes() {
        assert!(OpenRouterAdapter::is_refusal("I cannot help with that."));
        assert!(OpenRouterAdapter::is_refusal("  I'm unable to answer."));
        assert!(!OpenRouterAdapter::is_refusal(
            "Water boils at 100 degrees Celsius.\nI cannot stress this enough."
        ));
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let adapter =
            OpenRouterAdapter::with_config("sk-test", "http://localhost:1/v1/", Duration::from_secs(1))
                .unwrap();
        assert_eq!(adapter.url("embeddings"), "http://localhost:1/v1/embeddings");
    }
}
