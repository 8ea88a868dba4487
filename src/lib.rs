#![forbid(unsafe_code)]

//! # eva-harness
//!
//! A reliability gate for generative model outputs that does not assume
//! ground truth.
//!
//! For each prompt the evaluator samples several outputs and measures three
//! signals: how self-consistent they are (stability S), how brittle the task
//! is to rewording or resampling (difficulty D), and how well the outputs pass
//! external checks (verification V). These fold into one bounded reliability
//! score R, and the answer is accepted when R clears a configured threshold.
//! The number of samples adapts to the measured uncertainty.
//!
//! ```no_run
//! use std::sync::Arc;
//! use eva_harness::{EvaConfig, Evaluator, EmbeddingSimilarity, FnGenerator, HashedNgramEmbedder};
//!
//! # async fn demo() -> Result<(), eva_harness::EvaluationError> {
//! let evaluator = Evaluator::new(
//!     EvaConfig::default(),
//!     Arc::new(FnGenerator::new(|_| "Paris".to_string())),
//!     Arc::new(EmbeddingSimilarity::new(HashedNgramEmbedder::default())),
//! )?;
//! let result = evaluator.run("What is the capital of France?").await?;
//! println!("accepted={} R={:.3}", result.accepted, result.reliability);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod difficulty;
pub mod error;
pub mod gateway;
pub mod generation;
pub mod orchestrator;
pub mod reliability;
pub mod sampling_policy;
pub mod similarity;
pub mod stability;
pub mod trace;
pub mod types;
pub mod verification;

pub use cache::{EmbeddingCache, EmbeddingCacheKey, SqliteEmbeddingCache};
pub use config::{ConfigError, EvaConfig};
pub use difficulty::{DifficultyEstimator, DifficultyKind, DifficultyStrategy};
pub use error::{EstimationError, EvaluationError};
pub use gateway::{
    Attribution, ChatGateway, EmbedGateway, ProviderError, ProviderGateway, UsageSink,
};
pub use generation::{ChatGenerator, FnGenerator, GenerationError, Generator, Sampler};
pub use orchestrator::Evaluator;
pub use reliability::{ReliabilityFormula, ReliabilityScorer};
pub use sampling_policy::{AdaptiveSamplingPolicy, InitialSampling, SamplingRule};
pub use similarity::{
    EmbeddingSimilarity, GatewayEmbedder, HashedNgramEmbedder, SimilarityError, SimilarityMatrix,
    SimilarityProvider,
};
pub use stability::{StabilityDamping, StabilityEstimator, StabilityRange};
pub use trace::{JsonlTraceSink, PhaseTrace, TraceError, TraceSink, TraceWorker};
pub use types::{EvaluationPhase, EvaluationResult, EvaluationStatus};
pub use verification::{
    aggregate, FnVerifier, KeywordMatch, KeywordVerifier, NoOpVerifier, RegexVerifier, Verifier,
    VerifierError,
};
