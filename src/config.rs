//! Process-wide evaluation configuration.
//!
//! Read-only during an evaluation. Every field has a serde default so a
//! partial JSON document (or `{}`) is a valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::difficulty::DifficultyStrategy;
use crate::reliability::ReliabilityFormula;
use crate::sampling_policy::{InitialSampling, SamplingRule};
use crate::stability::{StabilityDamping, StabilityRange};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

fn default_threshold() -> f64 {
    0.6
}

fn default_k_min() -> usize {
    3
}

fn default_k_max() -> usize {
    10
}

fn default_sample_concurrency() -> usize {
    4
}

fn default_max_generation_retries() -> u32 {
    2
}

fn default_retry_base_delay_ms() -> u64 {
    250
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvaConfig {
    /// Accept when R >= threshold.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_k_min")]
    pub k_min: usize,
    #[serde(default = "default_k_max")]
    pub k_max: usize,
    #[serde(default)]
    pub reliability: ReliabilityFormula,
    #[serde(default)]
    pub stability_range: StabilityRange,
    /// S for fewer than two outputs. Midpoint of the signed range by default.
    #[serde(default)]
    pub stability_neutral: f64,
    #[serde(default)]
    pub stability_damping: StabilityDamping,
    #[serde(default)]
    pub sampling_rule: SamplingRule,
    #[serde(default)]
    pub initial_sampling: InitialSampling,
    #[serde(default)]
    pub difficulty: DifficultyStrategy,
    /// Parallel generation calls within one batch.
    #[serde(default = "default_sample_concurrency")]
    pub sample_concurrency: usize,
    #[serde(default = "default_max_generation_retries")]
    pub max_generation_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Overall deadline per evaluation; `None` means no deadline.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Default for EvaConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            k_min: default_k_min(),
            k_max: default_k_max(),
            reliability: ReliabilityFormula::default(),
            stability_range: StabilityRange::default(),
            stability_neutral: 0.0,
            stability_damping: StabilityDamping::default(),
            sampling_rule: SamplingRule::default(),
            initial_sampling: InitialSampling::default(),
            difficulty: DifficultyStrategy::default(),
            sample_concurrency: default_sample_concurrency(),
            max_generation_retries: default_max_generation_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            timeout_ms: None,
        }
    }
}

impl EvaConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.k_min < 1 {
            return Err(ConfigError::invalid("k_min must be >= 1"));
        }
        if self.k_min > self.k_max {
            return Err(ConfigError::invalid(format!(
                "k_min ({}) must be <= k_max ({})",
                self.k_min, self.k_max
            )));
        }
        if !self.threshold.is_finite() || !self.reliability.accepts_threshold(self.threshold) {
            let range = match self.reliability {
                ReliabilityFormula::Multiplicative => "[0, 1]",
                ReliabilityFormula::Logistic { .. } => "(0, 1)",
            };
            return Err(ConfigError::invalid(format!(
                "threshold {} is outside the reliability range {range}",
                self.threshold
            )));
        }
        if let Some((alpha, beta, gamma)) = self.reliability.weights() {
            check_weight("alpha", alpha)?;
            check_weight("beta", beta)?;
            check_weight("gamma", gamma)?;
        }
        if !self.stability_range.contains(self.stability_neutral) {
            let (lo, hi) = self.stability_range.bounds();
            return Err(ConfigError::invalid(format!(
                "stability_neutral {} is outside [{lo}, {hi}]",
                self.stability_neutral
            )));
        }
        if let SamplingRule::Additive { lambda, mu } = self.sampling_rule {
            check_weight("lambda", lambda)?;
            check_weight("mu", mu)?;
            let span = (self.k_max - self.k_min) as f64;
            if lambda + mu < span {
                return Err(ConfigError::invalid(format!(
                    "lambda + mu ({}) cannot reach k_max at maximal uncertainty (need >= {span})",
                    lambda + mu
                )));
            }
        }
        if let InitialSampling::NeutralPrior { prior } = self.initial_sampling {
            if !(0.0..=1.0).contains(&prior) {
                return Err(ConfigError::invalid(format!(
                    "neutral prior {prior} is outside [0, 1]"
                )));
            }
        }
        match &self.difficulty {
            DifficultyStrategy::Perturbation { framings } if framings.is_empty() => {
                return Err(ConfigError::invalid("perturbation needs at least one framing"));
            }
            DifficultyStrategy::Repetition { samples } if *samples < 1 => {
                return Err(ConfigError::invalid("repetition needs at least one sample"));
            }
            _ => {}
        }
        if self.sample_concurrency < 1 {
            return Err(ConfigError::invalid("sample_concurrency must be >= 1"));
        }
        if self.timeout_ms == Some(0) {
            return Err(ConfigError::invalid("timeout_ms must be > 0 when set"));
        }
        Ok(())
    }
}

fn check_weight(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(format!(
            "{name} must be finite and nonnegative, got {value}"
        )))
    }
}
