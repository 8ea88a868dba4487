use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eva_harness::{
    DifficultyStrategy, EmbeddingSimilarity, EvaConfig, EvaluationPhase, EvaluationStatus,
    Evaluator, GenerationError, Generator, HashedNgramEmbedder,
};

/// Answers the first `fast` calls immediately; later calls hang far past any test deadline.
struct StallingGenerator {
    calls: AtomicUsize,
    fast: usize,
    on_call: Option<Arc<AtomicBool>>,
}

impl StallingGenerator {
    fn new(fast: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fast,
            on_call: None,
        }
    }

    fn raising(mut self, flag: Arc<AtomicBool>) -> Self {
        self.on_call = Some(flag);
        self
    }
}

#[async_trait]
impl Generator for StallingGenerator {
    async fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
        if let Some(flag) = &self.on_call {
            flag.store(true, Ordering::SeqCst);
        }
        if self.calls.fetch_add(1, Ordering::SeqCst) >= self.fast {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        Ok("same answer".to_string())
    }
}

fn config(timeout_ms: Option<u64>) -> EvaConfig {
    EvaConfig {
        threshold: 0.0,
        timeout_ms,
        difficulty: DifficultyStrategy::Perturbation {
            framings: vec!["{prompt}".into()],
        },
        ..EvaConfig::default()
    }
}

fn hashed() -> Arc<EmbeddingSimilarity<HashedNgramEmbedder>> {
    Arc::new(EmbeddingSimilarity::new(HashedNgramEmbedder::default()))
}

#[tokio::test]
async fn timeout_returns_best_effort_reject_with_completed_samples() {
    let evaluator = Evaluator::new(
        config(Some(200)),
        Arc::new(StallingGenerator::new(2)),
        hashed(),
    )
    .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(10), evaluator.run("q"))
        .await
        .expect("deadline must cut the stalled batch")
        .unwrap();

    assert_eq!(result.status, EvaluationStatus::TimedOut);
    assert_eq!(result.interrupted_at, Some(EvaluationPhase::InitialSampling));
    assert_eq!(result.reason_code(), "timed_out");
    // A zero threshold would accept any completed run.
    assert!(!result.accepted);
    assert_eq!(result.samples_used, 2);
    assert_eq!(result.outputs, vec!["same answer", "same answer"]);
    assert_eq!(result.stability, 0.0);
    assert_eq!(result.verification, 0.0);
    assert_eq!(result.difficulty, 0.0);
}

#[tokio::test]
async fn cancel_flag_stops_at_next_phase_boundary() {
    let flag = Arc::new(AtomicBool::new(false));
    let evaluator = Evaluator::new(
        config(None),
        Arc::new(StallingGenerator::new(usize::MAX).raising(flag.clone())),
        hashed(),
    )
    .unwrap();

    let result = evaluator
        .run_with_cancel("q", Some(flag.as_ref()))
        .await
        .unwrap();

    assert_eq!(result.status, EvaluationStatus::Cancelled);
    assert_eq!(result.interrupted_at, Some(EvaluationPhase::Stability));
    assert!(!result.accepted);
    assert_eq!(result.samples_used, 3);
    assert_eq!(result.reason_code(), "cancelled");
}

#[tokio::test]
async fn unset_cancel_flag_does_not_interfere() {
    let flag = AtomicBool::new(false);
    let evaluator = Evaluator::new(
        config(Some(5_000)),
        Arc::new(StallingGenerator::new(usize::MAX)),
        hashed(),
    )
    .unwrap();

    let result = evaluator.run_with_cancel("q", Some(&flag)).await.unwrap();
    assert_eq!(result.status, EvaluationStatus::Completed);
    assert!(result.accepted);
    assert!(result.interrupted_at.is_none());
}
