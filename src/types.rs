//! Evaluation records shared across the pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::difficulty::DifficultyKind;
use crate::verification::VerifierScore;

/// States of one evaluation, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationPhase {
    Init,
    Difficulty,
    InitialSampling,
    Stability,
    AdaptiveResample,
    Verification,
    Reliability,
    Decision,
    Done,
}

impl EvaluationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Difficulty => "difficulty",
            Self::InitialSampling => "initial_sampling",
            Self::Stability => "stability",
            Self::AdaptiveResample => "adaptive_resample",
            Self::Verification => "verification",
            Self::Reliability => "reliability",
            Self::Decision => "decision",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for EvaluationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Completed,
    TimedOut,
    Cancelled,
}

impl EvaluationStatus {
    pub fn is_interrupted(&self) -> bool {
        !matches!(self, Self::Completed)
    }
}

/// Outcome of one `run` call. Built once in DECISION and never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationResult {
    pub evaluation_id: Uuid,
    pub prompt: String,
    pub accepted: bool,
    pub reliability: f64,
    pub stability: f64,
    pub difficulty: f64,
    pub verification: f64,
    pub threshold: f64,
    pub samples_used: usize,
    pub outputs: Vec<String>,
    pub status: EvaluationStatus,
    /// Phase that was running when a timeout or cancellation hit.
    pub interrupted_at: Option<EvaluationPhase>,
    pub difficulty_strategy: DifficultyKind,
    pub verifier_scores: Vec<VerifierScore>,
    /// Generation calls dropped after exhausting retries, all phases.
    pub generation_failures: usize,
    pub elapsed_ms: u64,
}

impl EvaluationResult {
    /// `accepted`, `below_threshold`, `timed_out` or `cancelled`.
    pub fn reason_code(&self) -> &'static str {
        match self.status {
            EvaluationStatus::TimedOut => "timed_out",
            EvaluationStatus::Cancelled => "cancelled",
            EvaluationStatus::Completed if self.accepted => "accepted",
            EvaluationStatus::Completed => "below_threshold",
        }
    }
}
