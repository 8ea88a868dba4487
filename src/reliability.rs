//! Reliability: fold S, V and D into one bounded score.

use serde::{Deserialize, Serialize};

use crate::stability::StabilityRange;

/// Logistic output is kept strictly inside (0, 1) even where `exp` saturates.
const LOGISTIC_EPSILON: f64 = 1e-12;

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "formula", rename_all = "snake_case")]
pub enum ReliabilityFormula {
    /// `clamp(S' * V * (1 - D), 0, 1)`. Collapses if any one signal is poor.
    Multiplicative,
    /// `sigmoid(alpha * S + beta * V - gamma * D)`. Softer; strictly inside (0, 1).
    Logistic {
        #[serde(default = "default_weight")]
        alpha: f64,
        #[serde(default = "default_weight")]
        beta: f64,
        #[serde(default = "default_weight")]
        gamma: f64,
    },
}

impl Default for ReliabilityFormula {
    fn default() -> Self {
        Self::Multiplicative
    }
}

impl ReliabilityFormula {
    /// Whether `threshold` lies inside this formula's output range.
    pub fn accepts_threshold(&self, threshold: f64) -> bool {
        match self {
            Self::Multiplicative => (0.0..=1.0).contains(&threshold),
            Self::Logistic { .. } => threshold > 0.0 && threshold < 1.0,
        }
    }

    pub fn weights(&self) -> Option<(f64, f64, f64)> {
        match *self {
            Self::Multiplicative => None,
            Self::Logistic { alpha, beta, gamma } => Some((alpha, beta, gamma)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReliabilityScorer {
    formula: ReliabilityFormula,
    range: StabilityRange,
}

impl ReliabilityScorer {
    /// `range` is the native range of the S values passed to `score`.
    pub fn new(formula: ReliabilityFormula, range: StabilityRange) -> Self {
        Self { formula, range }
    }

    pub fn formula(&self) -> &ReliabilityFormula {
        &self.formula
    }

    /// R for the given signals. Inputs are clamped into their ranges first.
    pub fn score(&self, stability: f64, verification: f64, difficulty: f64) -> f64 {
        let v = clamp_unit(verification, 0.0);
        let d = clamp_unit(difficulty, 1.0);
        match self.formula {
            ReliabilityFormula::Multiplicative => {
                let s = self.range.rescale(stability);
                clamp_unit(s * v * (1.0 - d), 0.0)
            }
            ReliabilityFormula::Logistic { alpha, beta, gamma } => {
                let s = self.range.clamp(stability);
                sigmoid(alpha * s + beta * v - gamma * d)
                    .clamp(LOGISTIC_EPSILON, 1.0 - LOGISTIC_EPSILON)
            }
        }
    }
}

pub fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

fn clamp_unit(x: f64, nan: f64) -> f64 {
    if x.is_nan() {
        nan
    } else {
        x.clamp(0.0, 1.0)
    }
}
