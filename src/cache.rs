//! SQLite-backed cache for text embeddings.
//!
//! Repeated evaluations of similar prompts tend to produce the same output
//! strings, so embeddings are cached by `(model, text)`.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingCacheKey {
    pub model: String,
    pub text_hash: String,
    pub key_hash: String,
}

impl EmbeddingCacheKey {
    pub fn new(model: &str, text: &str) -> Self {
        let text_hash = blake3::hash(text.as_bytes()).to_hex().to_string();
        let mut hasher = blake3::Hasher::new();
        hasher.update(model.as_bytes());
        hasher.update(b"|");
        hasher.update(text_hash.as_bytes());
        let key_hash = hasher.finalize().to_hex().to_string();

        Self {
            model: model.to_string(),
            text_hash,
            key_hash,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cache lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("corrupt embedding blob ({0} bytes)")]
    Corrupt(usize),
}

#[async_trait]
pub trait EmbeddingCache: Send + Sync {
    async fn get(&self, key: &EmbeddingCacheKey) -> Result<Option<Vec<f32>>, CacheError>;
    async fn put(&self, key: &EmbeddingCacheKey, embedding: &[f32]) -> Result<(), CacheError>;
}

#[derive(Clone)]
pub struct SqliteEmbeddingCache {
    path: Option<PathBuf>,
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePruneStats {
    pub deleted: usize,
    pub remaining: usize,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS embedding_cache (\
       key_hash TEXT PRIMARY KEY,\
       model TEXT NOT NULL,\
       text_hash TEXT NOT NULL,\
       dimensions INTEGER NOT NULL,\
       embedding BLOB NOT NULL,\
       created_at INTEGER NOT NULL,\
       updated_at INTEGER NOT NULL,\
       hit_count INTEGER NOT NULL DEFAULT 0\
     );";

impl SqliteEmbeddingCache {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            path: Some(path),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Process-local cache, gone when the last clone drops.
    pub fn in_memory() -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path: None,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("EVA_EMBEDDING_CACHE_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".eva_embedding_cache.sqlite")
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError>,
    {
        let guard = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        f(&guard)
    }

    pub async fn len(&self) -> Result<usize, CacheError> {
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM embedding_cache", [], |row| row.get(0))?;
                Ok(count.max(0) as usize)
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    /// Keep at most `max_rows` entries, evicting the least recently used.
    pub async fn prune(&self, max_rows: usize) -> Result<CachePruneStats, CacheError> {
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let deleted = conn.execute(
                    "DELETE FROM embedding_cache WHERE key_hash IN (\
                        SELECT key_hash FROM embedding_cache \
                        ORDER BY updated_at DESC, hit_count DESC LIMIT -1 OFFSET ?1\
                     )",
                    params![max_rows as i64],
                )?;
                let remaining: i64 =
                    conn.query_row("SELECT COUNT(*) FROM embedding_cache", [], |row| row.get(0))?;
                Ok(CachePruneStats {
                    deleted,
                    remaining: remaining.max(0) as usize,
                })
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

#[async_trait]
impl EmbeddingCache for SqliteEmbeddingCache {
    async fn get(&self, key: &EmbeddingCacheKey) -> Result<Option<Vec<f32>>, CacheError> {
        let key_hash = key.key_hash.clone();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let blob: Option<Vec<u8>> = conn
                    .query_row(
                        "SELECT embedding FROM embedding_cache WHERE key_hash = ?1",
                        params![key_hash],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(blob) = blob else {
                    return Ok(None);
                };
                conn.execute(
                    "UPDATE embedding_cache \
                     SET hit_count = hit_count + 1, updated_at = ?1 \
                     WHERE key_hash = ?2",
                    params![now_epoch(), key_hash],
                )?;
                decode_embedding(&blob).map(Some)
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    async fn put(&self, key: &EmbeddingCacheKey, embedding: &[f32]) -> Result<(), CacheError> {
        let key = key.clone();
        let blob = encode_embedding(embedding);
        let dimensions = embedding.len() as i64;
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let now = now_epoch();
                conn.execute(
                    "INSERT INTO embedding_cache (\
                        key_hash, model, text_hash, dimensions, embedding, created_at, updated_at\
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)\
                     ON CONFLICT(key_hash) DO UPDATE SET\
                        dimensions = excluded.dimensions,\
                        embedding = excluded.embedding,\
                        updated_at = excluded.updated_at",
                    params![
                        key.key_hash,
                        key.model,
                        key.text_hash,
                        dimensions,
                        blob,
                        now,
                        now
                    ],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(blob: &[u8]) -> Result<Vec<f32>, CacheError> {
    if blob.len() % 4 != 0 {
        return Err(CacheError::Corrupt(blob.len()));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_depends_on_model_and_text() {
        let a = EmbeddingCacheKey::new("m1", "hello");
        let b = EmbeddingCacheKey::new("m1", "hello");
        let c = EmbeddingCacheKey::new("m2", "hello");
        let d = EmbeddingCacheKey::new("m1", "hello!");
        assert_eq!(a, b);
        assert_ne!(a.key_hash, c.key_hash);
        assert_ne!(a.key_hash, d.key_hash);
        assert_eq!(a.text_hash, c.text_hash);
    }

    #[test]
    fn blob_encoding_preserves_values() {
        let v = vec![0.0_f32, -1.5, 3.25, f32::MIN_POSITIVE];
        assert_eq!(decode_embedding(&encode_embedding(&v)).unwrap(), v);
        assert!(matches!(
            decode_embedding(&[1, 2, 3]),
            Err(CacheError::Corrupt(3))
        ));
    }

    #[tokio::test]
    async fn in_memory_cache_round_trips_and_counts() {
        let cache = SqliteEmbeddingCache::in_memory().unwrap();
        let key = EmbeddingCacheKey::new("m", "text");
        assert!(cache.get(&key).await.unwrap().is_none());

        cache.put(&key, &[0.5, 0.25]).await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap(), Some(vec![0.5, 0.25]));
        assert_eq!(cache.len().await.unwrap(), 1);

        cache.put(&key, &[1.0]).await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap(), Some(vec![1.0]));
        assert_eq!(cache.len().await.unwrap(), 1);
    }
}
