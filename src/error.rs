//! Evaluation-level errors.

use crate::config::ConfigError;
use crate::similarity::SimilarityError;
use crate::trace::TraceError;
use crate::types::EvaluationPhase;

/// A signal (S or D) could not be estimated.
#[derive(Debug, thiserror::Error)]
pub enum EstimationError {
    #[error("all {attempted} generation calls failed; last error: {last_error}")]
    AllGenerationsFailed { attempted: usize, last_error: String },
    #[error("similarity provider failed: {0}")]
    Similarity(#[from] SimilarityError),
}

#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigError),
    #[error("{phase} failed: {source}")]
    Estimation {
        phase: EvaluationPhase,
        #[source]
        source: EstimationError,
    },
    #[error("trace sink failed: {0}")]
    Trace(#[from] TraceError),
}

impl EvaluationError {
    pub(crate) fn estimation(phase: EvaluationPhase, source: impl Into<EstimationError>) -> Self {
        Self::Estimation {
            phase,
            source: source.into(),
        }
    }

    /// Stable reason code for callers and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::Estimation {
                source: EstimationError::AllGenerationsFailed { .. },
                ..
            } => "all_generations_failed",
            Self::Estimation {
                source: EstimationError::Similarity(_),
                ..
            } => "similarity_failure",
            Self::Trace(_) => "trace_error",
        }
    }

    /// Phase the evaluation was in when it failed, if past INIT.
    pub fn phase(&self) -> Option<EvaluationPhase> {
        match self {
            Self::Estimation { phase, .. } => Some(*phase),
            Self::Configuration(_) => Some(EvaluationPhase::Init),
            Self::Trace(_) => None,
        }
    }
}
