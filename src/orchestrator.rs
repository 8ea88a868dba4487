//! Evaluation state machine.
//!
//! `INIT -> DIFFICULTY -> INITIAL_SAMPLING -> STABILITY -> ADAPTIVE_RESAMPLE
//! -> VERIFICATION -> RELIABILITY -> DECISION -> DONE`, strictly forward.
//! Cancellation and the overall deadline are checked at every phase boundary;
//! the deadline also bounds each in-flight phase, so a slow batch is cut off
//! with whatever samples already completed.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, EvaConfig};
use crate::difficulty::DifficultyEstimator;
use crate::error::{EstimationError, EvaluationError};
use crate::gateway::scope_evaluation;
use crate::generation::{BatchOutcome, Generator, SampleSet, Sampler};
use crate::reliability::ReliabilityScorer;
use crate::sampling_policy::{AdaptiveSamplingPolicy, InitialSampling};
use crate::similarity::{SerializedSimilarity, SimilarityProvider};
use crate::stability::StabilityEstimator;
use crate::trace::{now_epoch_ms, PhaseTrace, TraceSink};
use crate::types::{EvaluationPhase, EvaluationResult, EvaluationStatus};
use crate::verification::{aggregate, run_verifiers, AggregationError, Verifier, VerifierScore};

/// D assumed when an interrupted run never measured it.
const INTERRUPTED_DIFFICULTY: f64 = 1.0;
/// V assumed when an interrupted run never verified.
const INTERRUPTED_VERIFICATION: f64 = 0.0;

pub struct Evaluator {
    config: Arc<EvaConfig>,
    sampler: Sampler,
    similarity: Arc<dyn SimilarityProvider>,
    verifiers: Vec<Box<dyn Verifier>>,
    stability: StabilityEstimator,
    difficulty: DifficultyEstimator,
    policy: AdaptiveSamplingPolicy,
    scorer: ReliabilityScorer,
    trace: Option<Arc<dyn TraceSink>>,
}

/// Why `drive` stopped before DECISION.
enum Halt {
    Interrupted(EvaluationStatus),
    Failed(EvaluationError),
}

impl From<EvaluationError> for Halt {
    fn from(err: EvaluationError) -> Self {
        Self::Failed(err)
    }
}

/// Mutable state of one run; discarded once the result is built.
struct RunState {
    id: Uuid,
    phase: EvaluationPhase,
    samples: SampleSet,
    difficulty: Option<f64>,
    stability: Option<f64>,
    verification: Option<f64>,
    reliability: Option<f64>,
    verifier_scores: Vec<VerifierScore>,
    target_samples: Option<usize>,
    difficulty_failures: usize,
}

impl RunState {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            phase: EvaluationPhase::Init,
            samples: SampleSet::default(),
            difficulty: None,
            stability: None,
            verification: None,
            reliability: None,
            verifier_scores: Vec::new(),
            target_samples: None,
            difficulty_failures: 0,
        }
    }

    fn generation_failures(&self) -> usize {
        self.samples.failures + self.difficulty_failures
    }
}

impl Evaluator {
    /// Validates `config` eagerly. Collaborators that do not support
    /// concurrent calls are serialized here.
    pub fn new(
        config: EvaConfig,
        generator: Arc<dyn Generator>,
        similarity: Arc<dyn SimilarityProvider>,
    ) -> Result<Self, EvaluationError> {
        config.validate()?;

        let similarity: Arc<dyn SimilarityProvider> = if similarity.supports_concurrency() {
            similarity
        } else {
            Arc::new(SerializedSimilarity::new(similarity))
        };
        let sampler = Sampler::new(
            generator,
            config.sample_concurrency,
            config.max_generation_retries,
            config.retry_base_delay(),
        );

        Ok(Self {
            stability: StabilityEstimator::new(
                config.stability_neutral,
                config.stability_damping,
                config.stability_range,
            ),
            difficulty: DifficultyEstimator::new(config.difficulty.clone()),
            policy: AdaptiveSamplingPolicy::new(config.sampling_rule, config.stability_range),
            scorer: ReliabilityScorer::new(config.reliability, config.stability_range),
            config: Arc::new(config),
            sampler,
            similarity,
            verifiers: Vec::new(),
            trace: None,
        })
    }

    pub fn with_verifier(mut self, verifier: impl Verifier + 'static) -> Self {
        self.verifiers.push(Box::new(verifier));
        self
    }

    pub fn with_verifiers(mut self, verifiers: Vec<Box<dyn Verifier>>) -> Self {
        self.verifiers.extend(verifiers);
        self
    }

    pub fn with_trace(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(sink);
        self
    }

    pub fn config(&self) -> &EvaConfig {
        &self.config
    }

    pub async fn run(&self, prompt: &str) -> Result<EvaluationResult, EvaluationError> {
        self.run_with_cancel(prompt, None).await
    }

    /// Like [`run`](Self::run); a set `cancel_flag` stops at the next phase
    /// boundary with a `Cancelled`, never-accepted result.
    pub async fn run_with_cancel(
        &self,
        prompt: &str,
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<EvaluationResult, EvaluationError> {
        let started = Instant::now();
        let deadline = self.config.timeout().map(|t| started + t);
        let mut state = RunState::new();

        self.validate_verifiers()?;
        self.emit(&state)?;

        let id = state.id;
        let run = self.drive(prompt, &mut state, deadline, cancel_flag);
        let status = match scope_evaluation(id, run).await {
            Ok(()) => EvaluationStatus::Completed,
            Err(Halt::Interrupted(status)) => {
                warn!(
                    evaluation_id = %state.id,
                    phase = %state.phase,
                    samples = state.samples.len(),
                    status = ?status,
                    "Evaluation interrupted; returning best-effort reject"
                );
                status
            }
            Err(Halt::Failed(err)) => {
                warn!(
                    evaluation_id = %state.id,
                    phase = %state.phase,
                    code = err.code(),
                    error = %err,
                    "Evaluation failed"
                );
                return Err(err);
            }
        };

        let result = self.decide(prompt, state, status, started)?;
        info!(
            evaluation_id = %result.evaluation_id,
            accepted = result.accepted,
            reliability = result.reliability,
            samples = result.samples_used,
            reason = result.reason_code(),
            "Evaluation finished"
        );
        Ok(result)
    }

    /// Independent evaluations with at most `concurrency` in flight.
    /// Results are in input order.
    pub async fn evaluate_many(
        &self,
        prompts: &[String],
        concurrency: usize,
    ) -> Vec<Result<EvaluationResult, EvaluationError>> {
        stream::iter(prompts.iter().map(|prompt| self.run(prompt)))
            .buffered(concurrency.max(1))
            .collect()
            .await
    }

    // =========================================================================
    // Phases
    // =========================================================================

    async fn drive(
        &self,
        prompt: &str,
        state: &mut RunState,
        deadline: Option<Instant>,
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<(), Halt> {
        let (k_min, k_max) = (self.config.k_min, self.config.k_max);

        self.enter(state, EvaluationPhase::Difficulty, deadline, cancel_flag)?;
        let estimate = within(
            deadline,
            self.difficulty
                .compute(prompt, &self.sampler, self.similarity.as_ref()),
        )
        .await?
        .map_err(|e| EvaluationError::estimation(EvaluationPhase::Difficulty, e))?;
        state.difficulty = Some(estimate.score);
        state.difficulty_failures = estimate.failures;
        let difficulty = estimate.score;

        self.enter(state, EvaluationPhase::InitialSampling, deadline, cancel_flag)?;
        let initial = match self.config.initial_sampling {
            InitialSampling::MinSamples => k_min,
            InitialSampling::NeutralPrior { prior } => {
                self.policy.decide_rescaled(prior, difficulty, k_min, k_max)
            }
        };
        state.target_samples = Some(initial);
        let outcome = within(
            deadline,
            self.sampler.draw(prompt, initial, &mut state.samples),
        )
        .await?;
        ensure_batch(EvaluationPhase::InitialSampling, outcome, &state.samples)?;

        self.enter(state, EvaluationPhase::Stability, deadline, cancel_flag)?;
        let stability = self.measure_stability(state, deadline).await?;

        self.enter(state, EvaluationPhase::AdaptiveResample, deadline, cancel_flag)?;
        let k = self.policy.decide(stability, difficulty, k_min, k_max);
        state.target_samples = Some(k);
        let have = state.samples.len();
        if k > have {
            debug!(evaluation_id = %state.id, have, target = k, "resampling");
            let outcome = within(
                deadline,
                self.sampler.draw(prompt, k - have, &mut state.samples),
            )
            .await?;
            ensure_batch(EvaluationPhase::AdaptiveResample, outcome, &state.samples)?;
            self.measure_stability(state, deadline).await?;
        } else {
            debug!(evaluation_id = %state.id, have, target = k, "resampling skipped");
        }

        self.enter(state, EvaluationPhase::Verification, deadline, cancel_flag)?;
        let scores = within(
            deadline,
            run_verifiers(&self.verifiers, prompt, &state.samples.outputs),
        )
        .await?;
        state.verification = Some(self.aggregate_scores(state.id, &scores)?);
        state.verifier_scores = scores;

        self.enter(state, EvaluationPhase::Reliability, deadline, cancel_flag)?;
        let (s, v, d) = self.signals(state);
        state.reliability = Some(self.scorer.score(s, v, d));

        self.enter(state, EvaluationPhase::Decision, deadline, cancel_flag)?;
        Ok(())
    }

    async fn measure_stability(
        &self,
        state: &mut RunState,
        deadline: Option<Instant>,
    ) -> Result<f64, Halt> {
        let phase = state.phase;
        let s = within(
            deadline,
            self.stability
                .compute(self.similarity.as_ref(), &state.samples.outputs),
        )
        .await?
        .map_err(|e| EvaluationError::estimation(phase, e))?;
        state.stability = Some(s);
        Ok(s)
    }

    fn aggregate_scores(&self, id: Uuid, scores: &[VerifierScore]) -> Result<f64, Halt> {
        let values: Vec<f64> = scores.iter().map(|s| s.score).collect();
        let weights: Vec<f64> = scores.iter().map(|s| s.weight).collect();
        match aggregate(&values, &weights) {
            Ok(v) => Ok(v),
            Err(AggregationError::ZeroWeight) => {
                warn!(
                    evaluation_id = %id,
                    verifiers = scores.len(),
                    "Verifier weights sum to zero; treating as unverified (V = 1)"
                );
                Ok(1.0)
            }
            Err(err) => Err(EvaluationError::from(ConfigError::invalid(err.to_string())).into()),
        }
    }

    /// Transition into `phase`, honoring cancellation and the deadline.
    fn enter(
        &self,
        state: &mut RunState,
        phase: EvaluationPhase,
        deadline: Option<Instant>,
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<(), Halt> {
        state.phase = phase;
        if cancel_flag.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
            return Err(Halt::Interrupted(EvaluationStatus::Cancelled));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Halt::Interrupted(EvaluationStatus::TimedOut));
        }
        debug!(
            evaluation_id = %state.id,
            phase = %phase,
            samples = state.samples.len(),
            "entering phase"
        );
        self.emit(state)?;
        Ok(())
    }

    fn validate_verifiers(&self) -> Result<(), EvaluationError> {
        for v in &self.verifiers {
            let w = v.weight();
            if !w.is_finite() || w < 0.0 {
                return Err(ConfigError::invalid(format!(
                    "verifier {} has invalid weight {w}",
                    v.name()
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Current (S, V, D), with interrupted-run fallbacks for missing signals.
    fn signals(&self, state: &RunState) -> (f64, f64, f64) {
        let range = self.stability.range();
        let s = range.clamp(state.stability.unwrap_or(self.stability.neutral()));
        let v = state
            .verification
            .unwrap_or(INTERRUPTED_VERIFICATION)
            .clamp(0.0, 1.0);
        let d = state
            .difficulty
            .unwrap_or(INTERRUPTED_DIFFICULTY)
            .clamp(0.0, 1.0);
        (s, v, d)
    }

    fn decide(
        &self,
        prompt: &str,
        mut state: RunState,
        status: EvaluationStatus,
        started: Instant,
    ) -> Result<EvaluationResult, EvaluationError> {
        let (stability, verification, difficulty) = self.signals(&state);
        let reliability = match state.reliability {
            Some(r) if status == EvaluationStatus::Completed => r,
            _ => self.scorer.score(stability, verification, difficulty),
        };
        let accepted = status == EvaluationStatus::Completed && reliability >= self.config.threshold;
        let interrupted_at = status.is_interrupted().then_some(state.phase);

        state.reliability = Some(reliability);
        state.phase = EvaluationPhase::Done;
        self.emit(&state)?;

        let generation_failures = state.generation_failures();
        let outputs = state.samples.outputs;
        Ok(EvaluationResult {
            evaluation_id: state.id,
            prompt: prompt.to_string(),
            accepted,
            reliability,
            stability,
            difficulty,
            verification,
            threshold: self.config.threshold,
            samples_used: outputs.len(),
            outputs,
            status,
            interrupted_at,
            difficulty_strategy: self.difficulty.kind(),
            verifier_scores: state.verifier_scores,
            generation_failures,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn emit(&self, state: &RunState) -> Result<(), EvaluationError> {
        let Some(sink) = &self.trace else {
            return Ok(());
        };
        sink.record(PhaseTrace {
            timestamp_ms: now_epoch_ms(),
            evaluation_id: state.id,
            phase: state.phase,
            samples: state.samples.len(),
            generation_failures: state.generation_failures(),
            stability: state.stability,
            difficulty: state.difficulty,
            verification: state.verification,
            reliability: state.reliability,
            target_samples: state.target_samples,
        })?;
        Ok(())
    }
}

/// Await `fut`, giving up at `deadline`.
async fn within<F: Future>(deadline: Option<Instant>, fut: F) -> Result<F::Output, Halt> {
    match deadline {
        Some(d) => timeout_at(d, fut)
            .await
            .map_err(|_| Halt::Interrupted(EvaluationStatus::TimedOut)),
        None => Ok(fut.await),
    }
}

fn ensure_batch(
    phase: EvaluationPhase,
    outcome: BatchOutcome,
    samples: &SampleSet,
) -> Result<(), Halt> {
    if outcome.all_failed() {
        let err = EstimationError::AllGenerationsFailed {
            attempted: outcome.requested,
            last_error: samples.last_error.clone().unwrap_or_default(),
        };
        return Err(EvaluationError::estimation(phase, err).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::difficulty::DifficultyStrategy;
    use crate::generation::{FnGenerator, GenerationError};
    use crate::similarity::{
        EmbeddingSimilarity, HashedNgramEmbedder, SimilarityError, SimilarityMatrix,
    };
    use crate::trace::TraceError;
    use crate::verification::{FnVerifier, NoOpVerifier};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn hashed() -> Arc<dyn SimilarityProvider> {
        Arc::new(EmbeddingSimilarity::new(HashedNgramEmbedder::default()))
    }

    fn single_framing() -> EvaConfig {
        EvaConfig {
            difficulty: DifficultyStrategy::Perturbation {
                framings: vec!["{prompt}".into()],
            },
            retry_base_delay_ms: 0,
            ..EvaConfig::default()
        }
    }

    #[tokio::test]
    async fn constant_generator_draws_only_k_min() {
        let eval = Evaluator::new(
            single_framing(),
            Arc::new(FnGenerator::new(|_| "42".into())),
            hashed(),
        )
        .unwrap();
        let result = eval.run("q").await.unwrap();
        assert_eq!(result.samples_used, 3);
        assert_eq!(result.stability, 1.0);
        assert_eq!(result.verification, 1.0);
        assert_eq!(result.reliability, 1.0);
        assert!(result.accepted);
        assert_eq!(result.reason_code(), "accepted");
        assert!(result.interrupted_at.is_none());
    }

    #[tokio::test]
    async fn zero_weight_verifiers_fall_back_to_neutral() {
        let eval = Evaluator::new(
            single_framing(),
            Arc::new(FnGenerator::new(|_| "42".into())),
            hashed(),
        )
        .unwrap()
        .with_verifier(FnVerifier::new("never", |_, _| 0.0).with_weight(0.0));
        let result = eval.run("q").await.unwrap();
        assert_eq!(result.verification, 1.0);
        assert_eq!(result.verifier_scores.len(), 1);
    }

    #[tokio::test]
    async fn negative_verifier_weight_is_a_configuration_error() {
        let eval = Evaluator::new(
            single_framing(),
            Arc::new(FnGenerator::new(|_| "42".into())),
            hashed(),
        )
        .unwrap()
        .with_verifier(NoOpVerifier)
        .with_verifier(FnVerifier::new("bad", |_, _| 1.0).with_weight(-1.0));
        let err = eval.run("q").await.unwrap_err();
        assert_eq!(err.code(), "configuration_error");
    }

    #[tokio::test]
    async fn invalid_config_fails_at_construction() {
        let config = EvaConfig {
            k_min: 8,
            k_max: 2,
            ..EvaConfig::default()
        };
        let err = Evaluator::new(
            config,
            Arc::new(FnGenerator::new(|_| String::new())),
            hashed(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, EvaluationError::Configuration(_)));
    }

    #[tokio::test]
    async fn all_failed_initial_batch_is_an_error() {
        let eval = Evaluator::new(
            single_framing(),
            Arc::new(FnGenerator::fallible(|_| {
                Err(GenerationError::permanent("model offline"))
            })),
            hashed(),
        )
        .unwrap();
        let err = eval.run("q").await.unwrap_err();
        assert_eq!(err.code(), "all_generations_failed");
        assert_eq!(err.phase(), Some(EvaluationPhase::InitialSampling));
    }

    #[tokio::test]
    async fn preset_cancel_flag_rejects_before_any_work() {
        let eval = Evaluator::new(
            single_framing(),
            Arc::new(FnGenerator::new(|_| "42".into())),
            hashed(),
        )
        .unwrap();
        let flag = AtomicBool::new(true);
        let result = eval.run_with_cancel("q", Some(&flag)).await.unwrap();
        assert_eq!(result.status, EvaluationStatus::Cancelled);
        assert_eq!(result.interrupted_at, Some(EvaluationPhase::Difficulty));
        assert!(!result.accepted);
        assert_eq!(result.samples_used, 0);
        assert_eq!(result.difficulty, 1.0);
        assert_eq!(result.verification, 0.0);
        assert_eq!(result.reliability, 0.0);
        assert_eq!(result.reason_code(), "cancelled");
    }

    struct EmbeddingsDown;

    #[async_trait::async_trait]
    impl SimilarityProvider for EmbeddingsDown {
        async fn similarity_matrix(
            &self,
            _texts: &[String],
        ) -> Result<SimilarityMatrix, SimilarityError> {
            Err(SimilarityError::Other("embedding backend down".into()))
        }
    }

    #[tokio::test]
    async fn similarity_failure_fails_the_evaluation() {
        let eval = Evaluator::new(
            single_framing(),
            Arc::new(FnGenerator::new(|_| "42".into())),
            Arc::new(EmbeddingsDown),
        )
        .unwrap();
        let err = eval.run("q").await.unwrap_err();
        assert_eq!(err.code(), "similarity_failure");
        assert_eq!(err.phase(), Some(EvaluationPhase::Stability));
    }

    #[derive(Default)]
    struct CollectingTrace(Mutex<Vec<PhaseTrace>>);

    impl TraceSink for CollectingTrace {
        fn record(&self, event: PhaseTrace) -> Result<(), TraceError> {
            self.0.lock().unwrap().push(event);
            Ok(())
        }
    }

    /// Samples in hand when the first stability measurement starts.
    async fn initial_draw(initial_sampling: InitialSampling) -> usize {
        let config = EvaConfig {
            initial_sampling,
            difficulty: DifficultyStrategy::Repetition { samples: 4 },
            retry_base_delay_ms: 0,
            ..EvaConfig::default()
        };
        let n = AtomicUsize::new(0);
        let trace = Arc::new(CollectingTrace::default());
        let eval = Evaluator::new(
            config,
            Arc::new(FnGenerator::new(move |_| {
                format!("reply {}", n.fetch_add(1, Ordering::SeqCst))
            })),
            hashed(),
        )
        .unwrap()
        .with_trace(trace.clone());

        let result = eval.run("q").await.unwrap();
        assert_eq!(result.difficulty, 1.0);

        let events = trace.0.lock().unwrap();
        events
            .iter()
            .find(|e| e.phase == EvaluationPhase::Stability)
            .map(|e| e.samples)
            .unwrap()
    }

    #[tokio::test]
    async fn neutral_prior_sizes_the_first_batch_from_difficulty() {
        assert_eq!(initial_draw(InitialSampling::MinSamples).await, 3);
        // S' = 0.5, D = 1: round(3 + 0.75 * (10 - 3)) = 8.
        assert_eq!(
            initial_draw(InitialSampling::NeutralPrior { prior: 0.5 }).await,
            8
        );
    }
}
