use anyhow::Result;
use chrono::{DateTime, Utc};
use lru::LruCache;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::embedder::EncodeMode;

/// Cache key over encoding mode and content. Query and passage vectors for
/// the same text differ, so the mode is part of the hash input.
fn cache_key(mode: EncodeMode, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(mode.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Embedding cache entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub hash: String,
    pub vector: Vec<f32>,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

/// Two-tier embedding cache: LRU memory + SQLite disk.
pub struct EmbeddingCache {
    /// In-memory LRU cache (fast lookup)
    memory_cache: Arc<RwLock<LruCache<String, Vec<f32>>>>,
    /// SQLite connection pool for disk cache
    pool: SqlitePool,
    /// Model name for cache key
    model: String,
    /// Statistics
    hits: Arc<RwLock<CacheStats>>,
}

#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.memory_hits + self.disk_hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.memory_hits + self.disk_hits) as f64 / total as f64
        }
    }
}

impl EmbeddingCache {
    pub async fn new(pool: SqlitePool, model: String, memory_capacity: usize) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS embedding_cache (
                content_hash TEXT PRIMARY KEY,
                vector BLOB NOT NULL,
                model TEXT NOT NULL,
                created_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_embedding_cache_model
            ON embedding_cache(model, created_at DESC)
            "#,
        )
        .execute(&pool)
        .await?;

        let capacity = NonZeroUsize::new(memory_capacity.max(1))
            .expect("capacity is at least 1");

        Ok(Self {
            memory_cache: Arc::new(RwLock::new(LruCache::new(capacity))),
            pool,
            model,
            hits: Arc::new(RwLock::new(CacheStats::default())),
        })
    }

    /// Get embedding from cache (memory → disk → None).
    pub async fn get(&self, mode: EncodeMode, content: &str) -> Result<Option<Vec<f32>>> {
        let hash = cache_key(mode, content);

        // Check memory cache first
        {
            let mut cache = self.memory_cache.write().await;
            if let Some(vector) = cache.get(&hash) {
                self.hits.write().await.memory_hits += 1;
                tracing::debug!("Cache hit (memory): {}", &hash[..8]);
                return Ok(Some(vector.clone()));
            }
        }

        // Check disk cache
        let result: Option<(Vec<u8>,)> = sqlx::query_as(
            "SELECT vector FROM embedding_cache WHERE content_hash = ? AND model = ?",
        )
        .bind(&hash)
        .bind(&self.model)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((vector_bytes,)) = result {
            let vector = deserialize_vector(&vector_bytes);

            // Populate memory cache
            self.memory_cache
                .write()
                .await
                .put(hash.clone(), vector.clone());

            self.hits.write().await.disk_hits += 1;
            tracing::debug!("Cache hit (disk): {}", &hash[..8]);
            return Ok(Some(vector));
        }

        // Cache miss
        self.hits.write().await.misses += 1;
        tracing::debug!("Cache miss: {}", &hash[..8]);
        Ok(None)
    }

    /// Store embedding in cache (both memory and disk).
    pub async fn put(&self, mode: EncodeMode, content: &str, vector: Vec<f32>) -> Result<()> {
        let hash = cache_key(mode, content);
        let vector_bytes = serialize_vector(&vector);

        sqlx::query(
            r#"
            INSERT INTO embedding_cache (content_hash, vector, model, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(content_hash) DO UPDATE SET
                vector = excluded.vector,
                created_at = excluded.created_at
            "#,
        )
        .bind(&hash)
        .bind(&vector_bytes)
        .bind(&self.model)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.memory_cache.write().await.put(hash.clone(), vector);

        tracing::debug!("Cached embedding: {}", &hash[..8]);
        Ok(())
    }

    /// Get cache statistics.
    pub async fn stats(&self) -> CacheStats {
        self.hits.read().await.clone()
    }

    /// Clear memory cache (keeps disk cache).
    pub async fn clear_memory(&self) {
        self.memory_cache.write().await.clear();
    }

    /// Evict old entries from disk cache (keep last N days).
    pub async fn evict_old(&self, days: i64) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(days);

        let result = sqlx::query("DELETE FROM embedding_cache WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

/// Serialize vector to bytes (little-endian Float32).
fn serialize_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for &v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Deserialize vector from bytes (little-endian Float32).
fn deserialize_vector(bytes: &[u8]) -> Vec<f32> {
    let mut vector = Vec::with_capacity(bytes.len() / 4);
    for chunk in bytes.chunks_exact(4) {
        let bits = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        vector.push(f32::from_bits(bits));
    }
    vector
}
