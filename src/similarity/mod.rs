//! Pairwise semantic similarity between generated outputs.
//!
//! The provider is an external collaborator; this module owns the contract
//! (a validated symmetric matrix with unit diagonal) and the pairwise mean
//! that both stability and perturbation difficulty are built on.

pub mod embedding;

use async_trait::async_trait;
use nalgebra::DMatrix;
use tokio::sync::Mutex;

use crate::cache::CacheError;
use crate::gateway::ProviderError;

pub use embedding::{Embedder, EmbeddingSimilarity, GatewayEmbedder, HashedNgramEmbedder};

/// Largest tolerated `|m[i][j] - m[j][i]|` before a matrix is rejected.
const SYMMETRY_TOLERANCE: f64 = 1e-6;

#[derive(Debug, thiserror::Error)]
pub enum SimilarityError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("embedding cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("expected a {expected}x{expected} matrix, got {rows}x{cols}")]
    Shape {
        expected: usize,
        rows: usize,
        cols: usize,
    },
    #[error("non-finite similarity at ({row}, {col})")]
    NonFinite { row: usize, col: usize },
    #[error("matrix is not symmetric at ({row}, {col})")]
    Asymmetric { row: usize, col: usize },
    #[error("expected {expected} embeddings, got {got}")]
    EmbeddingCount { expected: usize, got: usize },
    #[error("embedding dimensions differ: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
    #[error("{0}")]
    Other(String),
}

/// Symmetric pairwise similarity matrix with entries in [-1, 1] and unit diagonal.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityMatrix {
    inner: DMatrix<f64>,
}

impl SimilarityMatrix {
    /// Validate a provider matrix for `expected` texts.
    ///
    /// Off-range entries are clamped into [-1, 1] and the diagonal is forced to 1.
    /// Shape errors, non-finite entries and asymmetry are provider failures.
    pub fn new(mut inner: DMatrix<f64>, expected: usize) -> Result<Self, SimilarityError> {
        if inner.nrows() != expected || inner.ncols() != expected {
            return Err(SimilarityError::Shape {
                expected,
                rows: inner.nrows(),
                cols: inner.ncols(),
            });
        }
        for i in 0..expected {
            for j in 0..expected {
                if !inner[(i, j)].is_finite() {
                    return Err(SimilarityError::NonFinite { row: i, col: j });
                }
            }
        }
        for i in 0..expected {
            for j in (i + 1)..expected {
                if (inner[(i, j)] - inner[(j, i)]).abs() > SYMMETRY_TOLERANCE {
                    return Err(SimilarityError::Asymmetric { row: i, col: j });
                }
                let v = inner[(i, j)].clamp(-1.0, 1.0);
                inner[(i, j)] = v;
                inner[(j, i)] = v;
            }
            inner[(i, i)] = 1.0;
        }
        Ok(Self { inner })
    }

    /// Build from row vectors, e.g. from a provider that returns nested lists.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, SimilarityError> {
        let n = rows.len();
        if let Some(bad) = rows.iter().find(|r| r.len() != n) {
            return Err(SimilarityError::Shape {
                expected: n,
                rows: n,
                cols: bad.len(),
            });
        }
        let inner = DMatrix::from_fn(n, n, |i, j| rows[i][j]);
        Self::new(inner, n)
    }

    pub fn len(&self) -> usize {
        self.inner.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reject a matrix that does not cover exactly `expected` texts.
    pub fn ensure_len(&self, expected: usize) -> Result<(), SimilarityError> {
        if self.len() != expected {
            return Err(SimilarityError::Shape {
                expected,
                rows: self.len(),
                cols: self.len(),
            });
        }
        Ok(())
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.inner[(i, j)]
    }

    /// Strict upper triangle, each unordered pair once, sorted ascending.
    ///
    /// Sorting makes every reduction over the pairs independent of output order.
    pub fn upper_triangle(&self) -> Vec<f64> {
        let n = self.len();
        let mut values = Vec::with_capacity(n * n.saturating_sub(1) / 2);
        for i in 0..n {
            for j in (i + 1)..n {
                values.push(self.inner[(i, j)]);
            }
        }
        values.sort_by(|a, b| a.total_cmp(b));
        values
    }

    /// Mean over all unordered pairs; `None` with fewer than two texts.
    pub fn mean_pairwise(&self) -> Option<f64> {
        let upper = self.upper_triangle();
        if upper.is_empty() {
            return None;
        }
        Some(upper.iter().sum::<f64>() / upper.len() as f64)
    }
}

#[async_trait]
pub trait SimilarityProvider: Send + Sync {
    /// Pairwise similarity for `texts`, an `n x n` matrix in input order.
    async fn similarity_matrix(&self, texts: &[String])
        -> Result<SimilarityMatrix, SimilarityError>;

    /// Whether concurrent calls are safe. When false the evaluator serializes calls.
    fn supports_concurrency(&self) -> bool {
        true
    }
}

/// Serializes calls into a provider that is not safe to call concurrently.
pub struct SerializedSimilarity<P: ?Sized> {
    gate: Mutex<()>,
    inner: std::sync::Arc<P>,
}

impl<P: SimilarityProvider + ?Sized> SerializedSimilarity<P> {
    pub fn new(inner: std::sync::Arc<P>) -> Self {
        Self {
            gate: Mutex::new(()),
            inner,
        }
    }
}

#[async_trait]
impl<P: SimilarityProvider + ?Sized> SimilarityProvider for SerializedSimilarity<P> {
    async fn similarity_matrix(
        &self,
        texts: &[String],
    ) -> Result<SimilarityMatrix, SimilarityError> {
        let _guard = self.gate.lock().await;
        self.inner.similarity_matrix(texts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_clamps_entries_and_forces_unit_diagonal() {
        let m = SimilarityMatrix::from_rows(&[
            vec![0.5, 1.2, 0.1],
            vec![1.2, 0.9, -1.5],
            vec![0.1, -1.5, 1.0],
        ])
        .unwrap();
        assert_eq!(m.get(0, 0), 1.0);
        assert_eq!(m.get(1, 1), 1.0);
        assert_eq!(m.get(0, 1), 1.0);
        assert_eq!(m.get(1, 2), -1.0);
        assert_eq!(m.get(2, 1), -1.0);
    }

    #[test]
    fn new_rejects_bad_shape_nan_and_asymmetry() {
        let err = SimilarityMatrix::new(DMatrix::from_element(2, 3, 0.0), 2).unwrap_err();
        assert!(matches!(err, SimilarityError::Shape { .. }));

        let err = SimilarityMatrix::from_rows(&[vec![1.0, f64::NAN], vec![f64::NAN, 1.0]])
            .unwrap_err();
        assert!(matches!(err, SimilarityError::NonFinite { .. }));

        let err =
            SimilarityMatrix::from_rows(&[vec![1.0, 0.2], vec![0.7, 1.0]]).unwrap_err();
        assert!(matches!(err, SimilarityError::Asymmetric { row: 0, col: 1 }));
    }

    #[test]
    fn mean_pairwise_counts_each_pair_once() {
        let m = SimilarityMatrix::from_rows(&[
            vec![1.0, 0.2, 0.4],
            vec![0.2, 1.0, 0.9],
            vec![0.4, 0.9, 1.0],
        ])
        .unwrap();
        assert_eq!(m.upper_triangle(), vec![0.2, 0.4, 0.9]);
        assert!((m.mean_pairwise().unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn mean_pairwise_is_undefined_below_two_texts() {
        let one = SimilarityMatrix::from_rows(&[vec![1.0]]).unwrap();
        assert!(one.mean_pairwise().is_none());
        let none = SimilarityMatrix::from_rows(&[]).unwrap();
        assert!(none.is_empty());
        assert!(none.mean_pairwise().is_none());
    }
}
