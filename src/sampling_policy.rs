//! Adaptive sampling: how many samples k to spend on a prompt.

use serde::{Deserialize, Serialize};

use crate::stability::StabilityRange;

fn default_sensitivity() -> f64 {
    4.0
}

fn default_prior() -> f64 {
    0.5
}

/// How uncertainty maps to k. Both rules are monotone in `1 - S'` and `D`,
/// give `k_min` at `S' = 1, D = 0` and reach `k_max` at `S' = 0, D = 1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum SamplingRule {
    /// `k = round(k_min + ((1 - S') + D) / 2 * (k_max - k_min))`.
    Proportional,
    /// `k = k_min + ceil(lambda * (1 - S') + mu * D)`.
    Additive {
        #[serde(default = "default_sensitivity")]
        lambda: f64,
        #[serde(default = "default_sensitivity")]
        mu: f64,
    },
}

impl Default for SamplingRule {
    fn default() -> Self {
        Self::Proportional
    }
}

/// What S' to assume before the first sample, if k is decided up front.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum InitialSampling {
    /// Draw exactly `k_min`; the policy first runs after STABILITY.
    MinSamples,
    /// Seed the first decision with `S' = prior` and the measured D.
    NeutralPrior {
        #[serde(default = "default_prior")]
        prior: f64,
    },
}

impl Default for InitialSampling {
    fn default() -> Self {
        Self::MinSamples
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveSamplingPolicy {
    rule: SamplingRule,
    range: StabilityRange,
}

impl AdaptiveSamplingPolicy {
    pub fn new(rule: SamplingRule, range: StabilityRange) -> Self {
        Self { rule, range }
    }

    pub fn rule(&self) -> &SamplingRule {
        &self.rule
    }

    /// k for a native-range S.
    pub fn decide(&self, stability: f64, difficulty: f64, k_min: usize, k_max: usize) -> usize {
        self.decide_rescaled(self.range.rescale(stability), difficulty, k_min, k_max)
    }

    /// k for an S' already in [0, 1]. NaN S' counts as 0 and NaN D as 1.
    pub fn decide_rescaled(
        &self,
        stability_unit: f64,
        difficulty: f64,
        k_min: usize,
        k_max: usize,
    ) -> usize {
        let (lo, hi) = if k_min <= k_max {
            (k_min, k_max)
        } else {
            (k_max, k_min)
        };
        let s = if stability_unit.is_nan() {
            0.0
        } else {
            stability_unit.clamp(0.0, 1.0)
        };
        let d = if difficulty.is_nan() {
            1.0
        } else {
            difficulty.clamp(0.0, 1.0)
        };

        let k = match self.rule {
            SamplingRule::Proportional => {
                let alpha = ((1.0 - s) + d) / 2.0;
                (lo as f64 + alpha * (hi - lo) as f64).round()
            }
            SamplingRule::Additive { lambda, mu } => {
                lo as f64 + (lambda.max(0.0) * (1.0 - s) + mu.max(0.0) * d).ceil()
            }
        };
        if !k.is_finite() {
            return hi;
        }
        (k.max(lo as f64) as usize).min(hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proportional() -> AdaptiveSamplingPolicy {
        AdaptiveSamplingPolicy::new(SamplingRule::Proportional, StabilityRange::Signed)
    }

    fn additive() -> AdaptiveSamplingPolicy {
        AdaptiveSamplingPolicy::new(
            SamplingRule::Additive {
                lambda: 4.0,
                mu: 4.0,
            },
            StabilityRange::Signed,
        )
    }

    #[test]
    fn extremes_hit_the_bounds() {
        for policy in [proportional(), additive()] {
            assert_eq!(policy.decide(1.0, 0.0, 3, 10), 3);
            assert_eq!(policy.decide(-1.0, 1.0, 3, 10), 10);
            assert_eq!(policy.decide_rescaled(1.0, 0.0, 3, 10), 3);
            assert_eq!(policy.decide_rescaled(0.0, 1.0, 3, 10), 10);
        }
    }

    #[test]
    fn proportional_rounds_midpoints() {
        // S' = 0.5, D = 0.5: alpha = 0.5, 3 + 3.5 = 6.5 rounds away from zero.
        assert_eq!(proportional().decide_rescaled(0.5, 0.5, 3, 10), 7);
        assert_eq!(proportional().decide_rescaled(0.5, 0.0, 3, 10), 5);
    }

    #[test]
    fn additive_ceils_small_uncertainty_up() {
        assert_eq!(additive().decide_rescaled(0.99, 0.0, 3, 10), 4);
        assert_eq!(additive().decide_rescaled(1.0, 0.5, 3, 10), 5);
    }

    #[test]
    fn degenerate_inputs_stay_in_bounds() {
        let p = proportional();
        assert_eq!(p.decide(f64::NAN, f64::NAN, 3, 10), 10);
        assert_eq!(p.decide(1.0, 0.0, 4, 4), 4);
        assert_eq!(p.decide_rescaled(2.0, -1.0, 3, 10), 3);
    }

    #[test]
    fn prior_defaults_to_half() {
        let init: InitialSampling = serde_json::from_str(r#"{"mode":"neutral_prior"}"#).unwrap();
        assert_eq!(init, InitialSampling::NeutralPrior { prior: 0.5 });
    }
}
