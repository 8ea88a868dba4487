use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use eva_harness::cache::{EmbeddingCache, EmbeddingCacheKey, SqliteEmbeddingCache};
use eva_harness::similarity::Embedder;
use eva_harness::{EmbeddingSimilarity, HashedNgramEmbedder, SimilarityError, SimilarityProvider};
use tempfile::tempdir;

#[tokio::test]
async fn sqlite_cache_persists_across_reopen() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("nested").join("embeddings.sqlite");

    let key = EmbeddingCacheKey::new("hashed-ngram-8", "Paris is the capital of France.");
    {
        let cache = SqliteEmbeddingCache::new(&db_path).unwrap();
        assert_eq!(cache.path(), Some(db_path.as_path()));
        cache.put(&key, &[0.25, -0.5, 1.0]).await.unwrap();
    }

    let reopened = SqliteEmbeddingCache::new(&db_path).unwrap();
    assert_eq!(
        reopened.get(&key).await.unwrap(),
        Some(vec![0.25, -0.5, 1.0])
    );
    let other_model = EmbeddingCacheKey::new("other", "Paris is the capital of France.");
    assert!(reopened.get(&other_model).await.unwrap().is_none());
}

#[tokio::test]
async fn prune_keeps_the_most_recent_rows() {
    let dir = tempdir().unwrap();
    let cache = SqliteEmbeddingCache::new(dir.path().join("cache.sqlite")).unwrap();

    for i in 0..5 {
        let key = EmbeddingCacheKey::new("m", &format!("text {i}"));
        cache.put(&key, &[i as f32]).await.unwrap();
    }
    assert_eq!(cache.len().await.unwrap(), 5);

    let stats = cache.prune(2).await.unwrap();
    assert_eq!(stats.deleted, 3);
    assert_eq!(stats.remaining, 2);
    assert_eq!(cache.len().await.unwrap(), 2);

    let stats = cache.prune(10).await.unwrap();
    assert_eq!(stats.deleted, 0);
}

/// Counts texts sent for embedding.
struct CountingEmbedder {
    inner: HashedNgramEmbedder,
    embedded: Arc<AtomicUsize>,
}

#[async_trait]
impl Embedder for CountingEmbedder {
    fn model_id(&self) -> &str {
        "counting"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SimilarityError> {
        self.embedded.fetch_add(texts.len(), Ordering::SeqCst);
        self.inner.embed(texts).await
    }
}

#[tokio::test]
async fn similarity_reuses_cached_embeddings() {
    let embedded = Arc::new(AtomicUsize::new(0));
    let cache = Arc::new(SqliteEmbeddingCache::in_memory().unwrap());
    let similarity = EmbeddingSimilarity::new(CountingEmbedder {
        inner: HashedNgramEmbedder::new(256),
        embedded: embedded.clone(),
    })
    .with_cache(cache.clone());

    let texts: Vec<String> = ["alpha beta", "gamma delta", "alpha beta"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let first = similarity.similarity_matrix(&texts).await.unwrap();
    // Duplicates are embedded once.
    assert_eq!(embedded.load(Ordering::SeqCst), 2);
    assert_eq!(cache.len().await.unwrap(), 2);

    let second = similarity.similarity_matrix(&texts).await.unwrap();
    assert_eq!(embedded.load(Ordering::SeqCst), 2);
    assert_eq!(first, second);
    assert_eq!(second.get(0, 2), 1.0);
}
