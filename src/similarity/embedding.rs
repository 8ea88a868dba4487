//! Embedding-based similarity: cosine over normalized text embeddings.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use nalgebra::{DMatrix, DVector};
use tracing::warn;

use crate::cache::{EmbeddingCache, EmbeddingCacheKey};
use crate::gateway::{Attribution, EmbedGateway, EmbedRequest};

use super::{SimilarityError, SimilarityMatrix, SimilarityProvider};

// =============================================================================
// Embedders
// =============================================================================

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Stable model identifier; part of the cache key.
    fn model_id(&self) -> &str;

    /// One vector per text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SimilarityError>;
}

/// Deterministic offline embedder.
///
/// Lowercased word unigrams (weight 1.0) and character trigrams of
/// space-padded words (weight 0.5) are hashed into a fixed number of signed
/// buckets. Texts that share vocabulary land close together; texts with no
/// shared tokens are near-orthogonal. Useful for tests and for running without
/// a network embedding model.
#[derive(Debug, Clone)]
pub struct HashedNgramEmbedder {
    dimensions: usize,
    model_id: String,
}

pub const DEFAULT_HASHED_DIMENSIONS: usize = 4096;

const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.5;

impl Default for HashedNgramEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASHED_DIMENSIONS)
    }
}

impl HashedNgramEmbedder {
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        Self {
            dimensions,
            model_id: format!("hashed-ngram-{dimensions}"),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0_f32; self.dimensions];
        let lowered = text.to_lowercase();
        for word in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            self.add_feature(&mut v, "w", word, WORD_WEIGHT);

            let padded: Vec<char> = std::iter::once(' ')
                .chain(word.chars())
                .chain(std::iter::once(' '))
                .collect();
            for gram in padded.windows(3) {
                let gram: String = gram.iter().collect();
                self.add_feature(&mut v, "c", &gram, TRIGRAM_WEIGHT);
            }
        }
        v
    }

    fn add_feature(&self, v: &mut [f32], kind: &str, feature: &str, weight: f32) {
        let mut hasher = blake3::Hasher::new();
        hasher.update(kind.as_bytes());
        hasher.update(b":");
        hasher.update(feature.as_bytes());
        let digest = hasher.finalize();
        let bytes = digest.as_bytes();

        let mut bucket = [0u8; 8];
        bucket.copy_from_slice(&bytes[..8]);
        let idx = (u64::from_le_bytes(bucket) % self.dimensions as u64) as usize;
        let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
        v[idx] += sign * weight;
    }
}

#[async_trait]
impl Embedder for HashedNgramEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SimilarityError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Embeddings from a remote model through an [`EmbedGateway`].
pub struct GatewayEmbedder<G: EmbedGateway> {
    gateway: Arc<G>,
    model: String,
}

impl<G: EmbedGateway> GatewayEmbedder<G> {
    pub fn new(gateway: Arc<G>, model: impl Into<String>) -> Self {
        Self {
            gateway,
            model: model.into(),
        }
    }
}

#[async_trait]
impl<G: EmbedGateway> Embedder for GatewayEmbedder<G> {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SimilarityError> {
        let req = EmbedRequest::new(
            self.model.clone(),
            texts.to_vec(),
            Attribution::new("similarity::embed").in_current_evaluation(),
        );
        let resp = self.gateway.embed(req).await?;
        Ok(resp.embeddings)
    }
}

// =============================================================================
// Cosine similarity provider
// =============================================================================

/// [`SimilarityProvider`] backed by an [`Embedder`], with an optional cache.
///
/// Duplicate texts are embedded once. Byte-identical texts get similarity
/// exactly 1.0 regardless of floating point error in the embedding path.
pub struct EmbeddingSimilarity<E: Embedder> {
    embedder: E,
    cache: Option<Arc<dyn EmbeddingCache>>,
}

impl<E: Embedder> EmbeddingSimilarity<E> {
    pub fn new(embedder: E) -> Self {
        Self {
            embedder,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn EmbeddingCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn embedder(&self) -> &E {
        &self.embedder
    }

    async fn embed_unique(&self, unique: &[String]) -> Result<Vec<Vec<f32>>, SimilarityError> {
        let model = self.embedder.model_id().to_string();
        let mut resolved: Vec<Option<Vec<f32>>> = vec![None; unique.len()];

        if let Some(cache) = &self.cache {
            for (slot, text) in resolved.iter_mut().zip(unique) {
                match cache.get(&EmbeddingCacheKey::new(&model, text)).await {
                    Ok(hit) => *slot = hit,
                    Err(err) => {
                        warn!(error = %err, "Embedding cache read failed; embedding live");
                    }
                }
            }
        }

        let missing: Vec<usize> = (0..unique.len())
            .filter(|&i| resolved[i].is_none())
            .collect();
        if !missing.is_empty() {
            let texts: Vec<String> = missing.iter().map(|&i| unique[i].clone()).collect();
            let fresh = self.embedder.embed(&texts).await?;
            if fresh.len() != texts.len() {
                return Err(SimilarityError::EmbeddingCount {
                    expected: texts.len(),
                    got: fresh.len(),
                });
            }
            for (&i, vector) in missing.iter().zip(fresh) {
                if let Some(cache) = &self.cache {
                    let key = EmbeddingCacheKey::new(&model, &unique[i]);
                    if let Err(err) = cache.put(&key, &vector).await {
                        warn!(error = %err, "Embedding cache write failed");
                    }
                }
                resolved[i] = Some(vector);
            }
        }

        Ok(resolved.into_iter().map(Option::unwrap_or_default).collect())
    }
}

#[async_trait]
impl<E: Embedder> SimilarityProvider for EmbeddingSimilarity<E> {
    async fn similarity_matrix(
        &self,
        texts: &[String],
    ) -> Result<SimilarityMatrix, SimilarityError> {
        let n = texts.len();

        let mut unique: Vec<String> = Vec::new();
        let mut index_of: HashMap<&str, usize> = HashMap::new();
        let slots: Vec<usize> = texts
            .iter()
            .map(|t| {
                *index_of.entry(t.as_str()).or_insert_with(|| {
                    unique.push(t.clone());
                    unique.len() - 1
                })
            })
            .collect();

        let vectors = self.embed_unique(&unique).await?;
        let normalized = normalize_all(&vectors)?;

        let mut matrix = DMatrix::from_element(n, n, 0.0);
        for i in 0..n {
            matrix[(i, i)] = 1.0;
            for j in (i + 1)..n {
                let sim = if slots[i] == slots[j] {
                    1.0
                } else {
                    match (&normalized[slots[i]], &normalized[slots[j]]) {
                        (Some(a), Some(b)) => a.dot(b),
                        _ => 0.0,
                    }
                };
                matrix[(i, j)] = sim;
                matrix[(j, i)] = sim;
            }
        }
        SimilarityMatrix::new(matrix, n)
    }
}

/// Unit-normalize each vector; zero vectors (e.g. empty text) map to `None`.
fn normalize_all(vectors: &[Vec<f32>]) -> Result<Vec<Option<DVector<f64>>>, SimilarityError> {
    let mut dims: Option<usize> = None;
    vectors
        .iter()
        .map(|v| {
            match dims {
                Some(d) if d != v.len() => {
                    return Err(SimilarityError::DimensionMismatch {
                        left: d,
                        right: v.len(),
                    })
                }
                _ => dims = Some(v.len()),
            }
            let dv = DVector::from_iterator(v.len(), v.iter().map(|&x| x as f64));
            let norm = dv.norm();
            if norm > 0.0 && norm.is_finite() {
                Ok(Some(dv / norm))
            } else {
                Ok(None)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn hashed_embedder_is_deterministic_and_case_insensitive() {
        let e = HashedNgramEmbedder::new(512);
        assert_eq!(e.embed_one("Hello World"), e.embed_one("hello world"));
        assert_eq!(e.embed_one("abc").len(), 512);
        assert!(e.embed_one("").iter().all(|&x| x == 0.0));
    }

    #[tokio::test]
    async fn identical_texts_score_exactly_one() {
        let sim = EmbeddingSimilarity::new(HashedNgramEmbedder::default());
        let texts = strings(&["same answer", "same answer", "same answer"]);
        let m = sim.similarity_matrix(&texts).await.unwrap();
        assert_eq!(m.mean_pairwise(), Some(1.0));
    }

    #[tokio::test]
    async fn shared_vocabulary_scores_higher_than_disjoint() {
        let sim = EmbeddingSimilarity::new(HashedNgramEmbedder::default());
        let texts = strings(&[
            "Paris is the capital of France.",
            "The capital of France is Paris.",
            "Bananas are fruits.",
        ]);
        let m = sim.similarity_matrix(&texts).await.unwrap();
        assert!(m.get(0, 1) > 0.9, "paraphrase similarity {}", m.get(0, 1));
        assert!(m.get(0, 2).abs() < 0.3, "disjoint similarity {}", m.get(0, 2));
    }

    #[tokio::test]
    async fn empty_text_is_orthogonal_to_everything_but_itself() {
        let sim = EmbeddingSimilarity::new(HashedNgramEmbedder::default());
        let texts = strings(&["", "", "words"]);
        let m = sim.similarity_matrix(&texts).await.unwrap();
        assert_eq!(m.get(0, 1), 1.0);
        assert_eq!(m.get(0, 2), 0.0);
    }

    struct RaggedEmbedder;

    #[async_trait]
    impl Embedder for RaggedEmbedder {
        fn model_id(&self) -> &str {
            "ragged"
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SimilarityError> {
            Ok(texts
                .iter()
                .enumerate()
                .map(|(i, _)| vec![1.0; i + 1])
                .collect())
        }
    }

    #[tokio::test]
    async fn mismatched_dimensions_are_a_provider_failure() {
        let sim = EmbeddingSimilarity::new(RaggedEmbedder);
        let err = sim
            .similarity_matrix(&strings(&["a", "b"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SimilarityError::DimensionMismatch { .. }));
    }
}
