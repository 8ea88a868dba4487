//! Provider failures, classified by what the gateway does with them.
//!
//! `ProviderGateway` retries only what [`ProviderError::is_retryable`] allows;
//! once it gives up, the error surfaces as a generation failure (the sample is
//! dropped) or a similarity failure (the evaluation fails). Everything else a
//! caller needs is the short [`ProviderError::code`] written to usage records.

use thiserror::Error;

/// What a non-2xx response told us.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub http_status: Option<u16>,
    /// `error.code` from the response body, stringified.
    pub provider_code: Option<String>,
    /// `x-request-id` header, for support tickets.
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn for_status(status: u16) -> Self {
        Self {
            http_status: Some(status),
            ..Self::default()
        }
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

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("rate limited by provider (HTTP 429)")]
    RateLimited { context: ErrorContext },

    #[error("provider returned HTTP {status}: {message}")]
    Status {
        status: u16,
        message: String,
        context: ErrorContext,
    },

    /// A 2xx response whose body carried an `error` object.
    #[error("provider error: {message}")]
    Api { message: String },

    /// The model declined to answer. Asking again rarely helps.
    #[error("model refused: {0}")]
    Refused(String),

    #[error("input too large: {chars} chars (max {limit})")]
    InputTooLarge { chars: usize, limit: usize },

    /// Unparseable body, missing fields, oversized body, or wrong item count.
    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Missing API key or unusable client settings.
    #[error("gateway not configured: {0}")]
    Config(String),
}

impl ProviderError {
    /// Map a non-2xx status. 429 is rate limiting; 5xx is worth retrying.
    pub fn from_status(status: u16, message: impl Into<String>, context: ErrorContext) -> Self {
        match status {
            429 => Self::RateLimited { context },
            _ => Self::Status {
                status,
                message: message.into(),
                context,
            },
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Transient failures: rate limits, server errors, timeouts and refused connections.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Status { status, .. } => *status >= 500,
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Api { .. }
            | Self::Refused(_)
            | Self::InputTooLarge { .. }
            | Self::Malformed(_)
            | Self::Config(_) => false,
        }
    }

    /// Short code for logs and usage records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Status { status, .. } if *status >= 500 => "server_error",
            Self::Status { .. } => "client_error",
            Self::Api { .. } => "api_error",
            Self::Refused(_) => "refused",
            Self::InputTooLarge { .. } => "input_too_large",
            Self::Malformed(_) => "malformed_response",
            Self::Transport(_) => "transport_error",
            Self::Config(_) => "config_error",
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::RateLimited { context } | Self::Status { context, .. } => Some(context),
            _ => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.context().and_then(|c| c.request_id.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_separates_rate_limits_server_and_client_errors() {
        let limited = ProviderError::from_status(429, "slow down", ErrorContext::for_status(429));
        assert!(matches!(limited, ProviderError::RateLimited { .. }));
        assert!(limited.is_retryable());

        let server = ProviderError::from_status(503, "overloaded", ErrorContext::for_status(503));
        assert!(server.is_retryable());
        assert_eq!(server.code(), "server_error");

        let client = ProviderError::from_status(400, "bad model", ErrorContext::for_status(400));
        assert!(!client.is_retryable());
        assert_eq!(client.code(), "client_error");
    }

    #[test]
    fn response_level_failures_are_permanent() {
        for err in [
            ProviderError::Refused("I cannot".into()),
            ProviderError::malformed("no choices"),
            ProviderError::InputTooLarge { chars: 10, limit: 5 },
            ProviderError::Api {
                message: "model not found".into(),
            },
        ] {
            assert!(!err.is_retryable(), "{err}");
            assert!(err.context().is_none());
        }
    }

    #[test]
    fn request_id_comes_from_context() {
        let ctx = ErrorContext::for_status(502).with_request_id("req-9").with_code("502");
        let err = ProviderError::from_status(502, "bad gateway", ctx);
        assert_eq!(err.request_id(), Some("req-9"));
        assert_eq!(err.context().and_then(|c| c.provider_code.as_deref()), Some("502"));
    }
}
