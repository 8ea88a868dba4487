//! Difficulty: how brittle the model's answer is to wording or resampling.
//!
//! Two strategies share one estimator. Perturbation generates one output per
//! framed rephrasing and scores `1 - mean pairwise similarity`. Repetition
//! generates `n` outputs of the unmodified prompt and scores the fraction of
//! distinct strings.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EstimationError;
use crate::generation::{SampleSet, Sampler};
use crate::similarity::SimilarityProvider;

/// Placeholder replaced by the prompt in a perturbation framing.
pub const PROMPT_PLACEHOLDER: &str = "{prompt}";

pub fn default_framings() -> Vec<String> {
    [
        "{prompt}",
        "Please answer the following: {prompt}",
        "In simple terms, {prompt}",
        "From a theoretical perspective, {prompt}",
        "Explain concisely: {prompt}",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

pub fn default_repetition_samples() -> usize {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum DifficultyStrategy {
    Perturbation {
        #[serde(default = "default_framings")]
        framings: Vec<String>,
    },
    Repetition {
        #[serde(default = "default_repetition_samples")]
        samples: usize,
    },
}

impl Default for DifficultyStrategy {
    fn default() -> Self {
        Self::Perturbation {
            framings: default_framings(),
        }
    }
}

impl DifficultyStrategy {
    pub fn kind(&self) -> DifficultyKind {
        match self {
            Self::Perturbation { .. } => DifficultyKind::Perturbation,
            Self::Repetition { .. } => DifficultyKind::Repetition,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifficultyKind {
    Perturbation,
    Repetition,
}

impl fmt::Display for DifficultyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Perturbation => "perturbation",
            Self::Repetition => "repetition",
        })
    }
}

/// D plus the generation accounting behind it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DifficultyEstimate {
    pub score: f64,
    pub samples_drawn: usize,
    pub failures: usize,
}

#[derive(Debug, Clone)]
pub struct DifficultyEstimator {
    strategy: DifficultyStrategy,
}

impl DifficultyEstimator {
    pub fn new(strategy: DifficultyStrategy) -> Self {
        Self { strategy }
    }

    pub fn kind(&self) -> DifficultyKind {
        self.strategy.kind()
    }

    /// Framed variants of `prompt`; empty for the repetition strategy.
    pub fn rephrasings(&self, prompt: &str) -> Vec<String> {
        match &self.strategy {
            DifficultyStrategy::Perturbation { framings } => {
                framings.iter().map(|f| frame(f, prompt)).collect()
            }
            DifficultyStrategy::Repetition { .. } => Vec::new(),
        }
    }

    pub async fn compute(
        &self,
        prompt: &str,
        sampler: &Sampler,
        similarity: &dyn SimilarityProvider,
    ) -> Result<DifficultyEstimate, EstimationError> {
        match &self.strategy {
            DifficultyStrategy::Perturbation { .. } => {
                let variants = self.rephrasings(prompt);
                if variants.len() < 2 {
                    debug!(rephrasings = variants.len(), "single rephrasing; difficulty is 0");
                    return Ok(DifficultyEstimate {
                        score: 0.0,
                        samples_drawn: 0,
                        failures: 0,
                    });
                }

                let mut set = SampleSet::default();
                let outcome = sampler.draw_each(variants, &mut set).await;
                ensure_some_succeeded(outcome.requested, &set)?;

                let score = if set.len() < 2 {
                    0.0
                } else {
                    let matrix = similarity.similarity_matrix(&set.outputs).await?;
                    matrix.ensure_len(set.len())?;
                    match matrix.mean_pairwise() {
                        Some(mean) => clamp_unit(1.0 - mean),
                        None => 0.0,
                    }
                };
                Ok(DifficultyEstimate {
                    score,
                    samples_drawn: set.len(),
                    failures: set.failures,
                })
            }
            DifficultyStrategy::Repetition { samples } => {
                let mut set = SampleSet::default();
                let outcome = sampler.draw(prompt, *samples, &mut set).await;
                ensure_some_succeeded(outcome.requested, &set)?;

                let score = distinct_fraction(&set.outputs);
                Ok(DifficultyEstimate {
                    score,
                    samples_drawn: set.len(),
                    failures: set.failures,
                })
            }
        }
    }
}

fn frame(framing: &str, prompt: &str) -> String {
    if framing.contains(PROMPT_PLACEHOLDER) {
        framing.replace(PROMPT_PLACEHOLDER, prompt)
    } else {
        format!("{} {}", framing.trim_end(), prompt)
    }
}

fn ensure_some_succeeded(attempted: usize, set: &SampleSet) -> Result<(), EstimationError> {
    if attempted > 0 && set.is_empty() {
        return Err(EstimationError::AllGenerationsFailed {
            attempted,
            last_error: set.last_error.clone().unwrap_or_default(),
        });
    }
    Ok(())
}

/// Distinct strings over successful outputs, capped at 1. Zero outputs give 0.
fn distinct_fraction(outputs: &[String]) -> f64 {
    if outputs.is_empty() {
        return 0.0;
    }
    let distinct: HashSet<&str> = outputs.iter().map(String::as_str).collect();
    clamp_unit(distinct.len() as f64 / outputs.len() as f64)
}

fn clamp_unit(x: f64) -> f64 {
    if x.is_nan() {
        1.0
    } else {
        x.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::generation::{FnGenerator, GenerationError};
    use crate::similarity::{
        EmbeddingSimilarity, HashedNgramEmbedder, SimilarityError, SimilarityMatrix,
    };

    fn sampler(generator: FnGenerator) -> Sampler {
        Sampler::new(Arc::new(generator), 4, 0, Duration::ZERO)
    }

    fn similarity() -> EmbeddingSimilarity<HashedNgramEmbedder> {
        EmbeddingSimilarity::new(HashedNgramEmbedder::default())
    }

    #[test]
    fn framings_substitute_or_prefix_the_prompt() {
        let est = DifficultyEstimator::new(DifficultyStrategy::Perturbation {
            framings: vec!["{prompt}".into(), "Briefly:".into()],
        });
        assert_eq!(
            est.rephrasings("What is 2+2?"),
            vec!["What is 2+2?".to_string(), "Briefly: What is 2+2?".to_string()]
        );
        assert_eq!(est.kind(), DifficultyKind::Perturbation);
    }

    #[tokio::test]
    async fn single_rephrasing_scores_zero_without_generating() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let gen = FnGenerator::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            "x".into()
        });
        let est = DifficultyEstimator::new(DifficultyStrategy::Perturbation {
            framings: vec!["{prompt}".into()],
        });
        let d = est.compute("p", &sampler(gen), &similarity()).await.unwrap();
        assert_eq!(d.score, 0.0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn insensitive_model_has_zero_perturbation_difficulty() {
        let est = DifficultyEstimator::new(DifficultyStrategy::default());
        let d = est
            .compute("p", &sampler(FnGenerator::new(|_| "fixed".into())), &similarity())
            .await
            .unwrap();
        assert_eq!(d.score, 0.0);
        assert_eq!(d.samples_drawn, 5);
    }

    #[tokio::test]
    async fn echoing_model_is_harder_than_constant_model() {
        let est = DifficultyEstimator::new(DifficultyStrategy::Perturbation {
            framings: vec![
                "{prompt}".into(),
                "Zebra quartz xylophone {prompt}".into(),
                "Volcanic marmalade jukebox {prompt}".into(),
            ],
        });
        let d = est
            .compute("hi", &sampler(FnGenerator::new(|p| p.to_string())), &similarity())
            .await
            .unwrap();
        assert!(d.score > 0.2, "difficulty {}", d.score);
        assert!(d.score <= 1.0);
    }

    #[tokio::test]
    async fn repetition_counts_distinct_strings() {
        let n = Arc::new(AtomicUsize::new(0));
        let counter = n.clone();
        let gen = FnGenerator::new(move |_| {
            format!("answer {}", counter.fetch_add(1, Ordering::SeqCst) % 2)
        })
        .serialized();
        let est = DifficultyEstimator::new(DifficultyStrategy::Repetition { samples: 4 });
        let d = est.compute("p", &sampler(gen), &similarity()).await.unwrap();
        assert_eq!(d.score, 0.5);
        assert_eq!(est.kind(), DifficultyKind::Repetition);
    }

    #[tokio::test]
    async fn all_failed_generations_are_an_error() {
        let gen = FnGenerator::fallible(|_| Err(GenerationError::permanent("nope")));
        let est = DifficultyEstimator::new(DifficultyStrategy::Repetition { samples: 3 });
        let err = est.compute("p", &sampler(gen), &similarity()).await.unwrap_err();
        assert!(matches!(
            err,
            EstimationError::AllGenerationsFailed { attempted: 3, .. }
        ));
    }

    /// Always answers with a 2x2 matrix, whatever it was asked about.
    struct TwoByTwo;

    #[async_trait::async_trait]
    impl SimilarityProvider for TwoByTwo {
        async fn similarity_matrix(
            &self,
            _texts: &[String],
        ) -> Result<SimilarityMatrix, SimilarityError> {
            SimilarityMatrix::from_rows(&[vec![1.0, 0.5], vec![0.5, 1.0]])
        }
    }

    #[tokio::test]
    async fn perturbation_rejects_matrix_of_wrong_size() {
        let est = DifficultyEstimator::new(DifficultyStrategy::Perturbation {
            framings: vec!["{prompt}".into(), "Briefly:".into(), "Plainly:".into()],
        });
        let err = est
            .compute("p", &sampler(FnGenerator::new(|p| p.to_string())), &TwoByTwo)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EstimationError::Similarity(SimilarityError::Shape {
                expected: 3,
                rows: 2,
                ..
            })
        ));
    }

    #[test]
    fn strategy_deserializes_with_defaults() {
        let s: DifficultyStrategy = serde_json::from_str(r#"{"strategy":"repetition"}"#).unwrap();
        assert_eq!(s, DifficultyStrategy::Repetition { samples: 5 });
        let s: DifficultyStrategy = serde_json::from_str(r#"{"strategy":"perturbation"}"#).unwrap();
        assert_eq!(s, DifficultyStrategy::default());
    }
}
