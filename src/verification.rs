//! Verifiers and the conservative aggregate V.
//!
//! `V = 0.5 * weighted_mean + 0.5 * min`. The minimum term keeps a single
//! failing check from being averaged away by passing ones.

use async_trait::async_trait;
use futures::future::join_all;
use regex::Regex;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum VerifierError {
    #[error("verifier failed: {0}")]
    Failed(String),
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AggregationError {
    #[error("{scores} scores but {weights} weights")]
    LengthMismatch { scores: usize, weights: usize },
    #[error("verifier weights sum to zero")]
    ZeroWeight,
    #[error("weight {weight} at index {index} is negative or not finite")]
    InvalidWeight { index: usize, weight: f64 },
}

/// Aggregate verifier scores into V in [0, 1].
///
/// An empty input is epistemically neutral and yields 1.0. Scores are clamped
/// into [0, 1] (NaN counts as 0). Weights must be finite, nonnegative and sum
/// to a positive value.
pub fn aggregate(scores: &[f64], weights: &[f64]) -> Result<f64, AggregationError> {
    if scores.len() != weights.len() {
        return Err(AggregationError::LengthMismatch {
            scores: scores.len(),
            weights: weights.len(),
        });
    }
    if scores.is_empty() {
        return Ok(1.0);
    }
    if let Some((index, &weight)) = weights
        .iter()
        .enumerate()
        .find(|(_, w)| !w.is_finite() || **w < 0.0)
    {
        return Err(AggregationError::InvalidWeight { index, weight });
    }

    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return Err(AggregationError::ZeroWeight);
    }

    let clamped: Vec<f64> = scores.iter().map(|&s| clamp_score(s)).collect();
    let weighted_mean = clamped
        .iter()
        .zip(weights)
        .map(|(s, w)| s * w)
        .sum::<f64>()
        / total;
    let min = clamped.iter().copied().fold(f64::INFINITY, f64::min);

    Ok((0.5 * weighted_mean + 0.5 * min).clamp(0.0, 1.0))
}

fn clamp_score(s: f64) -> f64 {
    if s.is_nan() {
        0.0
    } else {
        s.clamp(0.0, 1.0)
    }
}

#[async_trait]
pub trait Verifier: Send + Sync {
    fn name(&self) -> &str;

    /// Nonnegative contribution to the weighted mean.
    fn weight(&self) -> f64 {
        1.0
    }

    /// Score in [0, 1] for the full output set of `prompt`.
    async fn verify(&self, prompt: &str, outputs: &[String]) -> Result<f64, VerifierError>;
}

/// One verifier's contribution, as recorded on the result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerifierScore {
    pub name: String,
    pub score: f64,
    pub weight: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Run every verifier concurrently. A verifier error scores 0.0.
pub async fn run_verifiers(
    verifiers: &[Box<dyn Verifier>],
    prompt: &str,
    outputs: &[String],
) -> Vec<VerifierScore> {
    join_all(verifiers.iter().map(|v| async move {
        match v.verify(prompt, outputs).await {
            Ok(score) => VerifierScore {
                name: v.name().to_string(),
                score: clamp_score(score),
                weight: v.weight(),
                error: None,
            },
            Err(err) => {
                warn!(verifier = v.name(), error = %err, "Verifier failed; scoring 0");
                VerifierScore {
                    name: v.name().to_string(),
                    score: 0.0,
                    weight: v.weight(),
                    error: Some(err.to_string()),
                }
            }
        }
    }))
    .await
}

/// Fraction of outputs satisfying `pred`; 0 for no outputs.
fn fraction_matching(outputs: &[String], pred: impl Fn(&str) -> bool) -> f64 {
    if outputs.is_empty() {
        return 0.0;
    }
    outputs.iter().filter(|o| pred(o.as_str())).count() as f64 / outputs.len() as f64
}

// =============================================================================
// Verifier variants
// =============================================================================

/// Always 1.0. Equivalent to having no verifiers.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpVerifier;

#[async_trait]
impl Verifier for NoOpVerifier {
    fn name(&self) -> &str {
        "noop"
    }

    async fn verify(&self, _prompt: &str, _outputs: &[String]) -> Result<f64, VerifierError> {
        Ok(1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeywordMatch {
    /// Output contains at least one keyword.
    #[default]
    Any,
    /// Output contains every keyword.
    All,
}

/// Case-insensitive substring check; score is the fraction of matching outputs.
#[derive(Debug, Clone)]
pub struct KeywordVerifier {
    keywords: Vec<String>,
    mode: KeywordMatch,
    weight: f64,
}

impl KeywordVerifier {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            mode: KeywordMatch::Any,
            weight: 1.0,
        }
    }

    pub fn mode(mut self, mode: KeywordMatch) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    fn matches(&self, output: &str) -> bool {
        let lowered = output.to_lowercase();
        match self.mode {
            KeywordMatch::Any => self.keywords.iter().any(|k| lowered.contains(k)),
            KeywordMatch::All => self.keywords.iter().all(|k| lowered.contains(k)),
        }
    }
}

#[async_trait]
impl Verifier for KeywordVerifier {
    fn name(&self) -> &str {
        "keyword"
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    async fn verify(&self, _prompt: &str, outputs: &[String]) -> Result<f64, VerifierError> {
        Ok(fraction_matching(outputs, |o| self.matches(o)))
    }
}

/// Fraction of outputs matching a regular expression.
#[derive(Debug, Clone)]
pub struct RegexVerifier {
    pattern: Regex,
    weight: f64,
}

impl RegexVerifier {
    pub fn new(pattern: &str) -> Result<Self, VerifierError> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            weight: 1.0,
        })
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

#[async_trait]
impl Verifier for RegexVerifier {
    fn name(&self) -> &str {
        "regex"
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    async fn verify(&self, _prompt: &str, outputs: &[String]) -> Result<f64, VerifierError> {
        Ok(fraction_matching(outputs, |o| self.pattern.is_match(o)))
    }
}

type VerifyFn = dyn Fn(&str, &[String]) -> Result<f64, VerifierError> + Send + Sync;

/// Custom check from a closure.
pub struct FnVerifier {
    name: String,
    weight: f64,
    f: Box<VerifyFn>,
}

impl FnVerifier {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&str, &[String]) -> f64 + Send + Sync + 'static,
    {
        Self::fallible(name, move |prompt, outputs| Ok(f(prompt, outputs)))
    }

    pub fn fallible<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&str, &[String]) -> Result<f64, VerifierError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            weight: 1.0,
            f: Box::new(f),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

#[async_trait]
impl Verifier for FnVerifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    async fn verify(&self, prompt: &str, outputs: &[String]) -> Result<f64, VerifierError> {
        (self.f)(prompt, outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_aggregate_is_neutral() {
        assert_eq!(aggregate(&[], &[]), Ok(1.0));
    }

    #[test]
    fn aggregate_blends_weighted_mean_and_min() {
        let v = aggregate(&[0.9, 0.3], &[1.0, 1.0]).unwrap();
        assert!((v - 0.45).abs() < 1e-12);

        // Weight shifts the mean but not the minimum.
        let v = aggregate(&[1.0, 0.0], &[3.0, 1.0]).unwrap();
        assert!((v - 0.375).abs() < 1e-12);
    }

    #[test]
    fn aggregate_rejects_degenerate_weights() {
        assert_eq!(aggregate(&[0.5], &[0.0]), Err(AggregationError::ZeroWeight));
        assert!(matches!(
            aggregate(&[0.5, 0.5], &[1.0, -1.0]),
            Err(AggregationError::InvalidWeight { index: 1, .. })
        ));
        assert!(matches!(
            aggregate(&[0.5], &[1.0, 1.0]),
            Err(AggregationError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn aggregate_clamps_scores() {
        assert_eq!(aggregate(&[1.7, f64::NAN], &[1.0, 1.0]), Ok(0.25));
    }

    #[tokio::test]
    async fn keyword_modes() {
        let outs = outputs(&["Paris is in France", "It is PARIS", "London"]);
        let any = KeywordVerifier::new(["paris", "france"]);
        let all = KeywordVerifier::new(["paris", "france"]).mode(KeywordMatch::All);
        let any_score = any.verify("q", &outs).await.unwrap();
        let all_score = all.verify("q", &outs).await.unwrap();
        assert!((any_score - 2.0 / 3.0).abs() < 1e-12);
        assert!((all_score - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(any.verify("q", &[]).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn regex_verifier_scores_matching_fraction() {
        let v = RegexVerifier::new(r"\b\d+\b").unwrap().with_weight(2.0);
        assert_eq!(v.weight(), 2.0);
        let score = v.verify("q", &outputs(&["42", "forty-two"])).await.unwrap();
        assert_eq!(score, 0.5);
        assert!(matches!(RegexVerifier::new("("), Err(VerifierError::Pattern(_))));
    }

    #[tokio::test]
    async fn failing_verifier_scores_zero() {
        let verifiers: Vec<Box<dyn Verifier>> = vec![
            Box::new(NoOpVerifier),
            Box::new(FnVerifier::fallible("flaky", |_, _| {
                Err(VerifierError::Failed("upstream timeout".into()))
            })),
            Box::new(FnVerifier::new("half", |_, _| 0.5).with_weight(0.5)),
        ];
        let scores = run_verifiers(&verifiers, "q", &outputs(&["a"])).await;
        assert_eq!(scores.len(), 3);
        assert_eq!(scores[0].score, 1.0);
        assert_eq!(scores[1].score, 0.0);
        assert!(scores[1].error.as_deref().unwrap().contains("upstream timeout"));
        assert_eq!(scores[2].weight, 0.5);
    }
}
