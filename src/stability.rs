//! Stability: semantic self-consistency of repeated outputs for one prompt.

use serde::{Deserialize, Serialize};

use crate::similarity::{SimilarityError, SimilarityMatrix, SimilarityProvider};

/// Similarity values are clipped into `[ENTROPY_FLOOR, 1]` before `ln`.
const ENTROPY_FLOOR: f64 = 1e-6;

/// Native range of S, and how it maps onto the unit interval S'.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilityRange {
    /// Cosine-based, S in [-1, 1], S' = (S + 1) / 2.
    #[default]
    Signed,
    /// Already nonnegative, S in [0, 1], S' = S.
    Unit,
}

impl StabilityRange {
    pub fn bounds(self) -> (f64, f64) {
        match self {
            Self::Signed => (-1.0, 1.0),
            Self::Unit => (0.0, 1.0),
        }
    }

    pub fn contains(self, s: f64) -> bool {
        let (lo, hi) = self.bounds();
        s.is_finite() && (lo..=hi).contains(&s)
    }

    /// Clamp into the native range. NaN maps to the lower bound.
    pub fn clamp(self, s: f64) -> f64 {
        let (lo, hi) = self.bounds();
        if s.is_nan() {
            lo
        } else {
            s.clamp(lo, hi)
        }
    }

    /// S -> S' in [0, 1].
    pub fn rescale(self, s: f64) -> f64 {
        let s = self.clamp(s);
        match self {
            Self::Signed => (s + 1.0) / 2.0,
            Self::Unit => s,
        }
    }

    /// S' -> S.
    pub fn unscale(self, unit: f64) -> f64 {
        let unit = if unit.is_nan() { 0.0 } else { unit.clamp(0.0, 1.0) };
        match self {
            Self::Signed => unit * 2.0 - 1.0,
            Self::Unit => unit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilityDamping {
    #[default]
    None,
    /// Scale S' by `1 - tanh(G)`, where `G = ln(m) - H(q)` is the entropy gap
    /// of the `m` pairwise similarities normalized into a distribution `q`.
    /// G is zero when every pair is equally similar and grows as agreement
    /// concentrates in a few pairs, so a set that is mostly similar with one
    /// outlier scores below a uniformly similar set of the same mean.
    Entropy,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StabilityEstimator {
    neutral: f64,
    damping: StabilityDamping,
    range: StabilityRange,
}

impl StabilityEstimator {
    /// `neutral` is returned for fewer than two outputs and must lie in `range`.
    pub fn new(neutral: f64, damping: StabilityDamping, range: StabilityRange) -> Self {
        Self {
            neutral,
            damping,
            range,
        }
    }

    pub fn neutral(&self) -> f64 {
        self.neutral
    }

    pub fn range(&self) -> StabilityRange {
        self.range
    }

    pub async fn compute(
        &self,
        provider: &dyn SimilarityProvider,
        outputs: &[String],
    ) -> Result<f64, SimilarityError> {
        if outputs.len() < 2 {
            return Ok(self.neutral);
        }
        let matrix = provider.similarity_matrix(outputs).await?;
        matrix.ensure_len(outputs.len())?;
        Ok(self.score_matrix(&matrix))
    }

    /// S for an already computed similarity matrix.
    pub fn score_matrix(&self, matrix: &SimilarityMatrix) -> f64 {
        let pairs = matrix.upper_triangle();
        if pairs.is_empty() {
            return self.neutral;
        }
        let mean = pairs.iter().sum::<f64>() / pairs.len() as f64;
        let s = self.range.clamp(mean);

        match self.damping {
            StabilityDamping::None => s,
            StabilityDamping::Entropy => match entropy_gap(&pairs) {
                gap if gap > 0.0 => self.range.unscale(self.range.rescale(s) * (1.0 - gap.tanh())),
                _ => s,
            },
        }
    }
}

/// `ln(m) - H(q)` for `q_i = p_i / sum(p)`, with `p` clipped into
/// `[ENTROPY_FLOOR, 1]`. Expects `pairs` sorted, as `upper_triangle` returns.
fn entropy_gap(pairs: &[f64]) -> f64 {
    let clipped: Vec<f64> = pairs.iter().map(|&p| p.clamp(ENTROPY_FLOOR, 1.0)).collect();
    match (clipped.first(), clipped.last()) {
        (Some(lo), Some(hi)) if lo < hi => {}
        _ => return 0.0,
    }
    let total: f64 = clipped.iter().sum();
    let entropy: f64 = clipped
        .iter()
        .map(|&p| {
            let q = p / total;
            -q * q.ln()
        })
        .sum();
    ((clipped.len() as f64).ln() - entropy).max(0.0)
}
