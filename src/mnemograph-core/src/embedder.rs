use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::cache::EmbeddingCache;
use crate::config::EmbeddingConfig;

/// Text encoding mode. Asymmetric models prompt queries and passages
/// differently, so the two modes must never share vectors or cache entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncodeMode {
    Query,
    Passage,
}

impl EncodeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncodeMode::Query => "query",
            EncodeMode::Passage => "passage",
        }
    }
}

/// Embedder trait for converting text to fixed-length vectors.
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    async fn encode(&self, mode: EncodeMode, texts: &[&str]) -> Result<Vec<Vec<f32>>>;
    fn dimensions(&self) -> usize;

    async fn encode_queries(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        self.encode(EncodeMode::Query, texts).await
    }

    async fn encode_passages(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        self.encode(EncodeMode::Passage, texts).await
    }
}

/// OpenAI-compatible embedding client (works with llama.cpp /v1/embeddings)
/// with optional caching.
pub struct HttpEmbedder {
    client: Client,
    config: EmbeddingConfig,
    cache: Option<Arc<EmbeddingCache>>,
}

#[derive(Serialize)]
struct EmbeddingRequest {
    input: serde_json::Value, // String or array of strings
    model: String,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        let client = if config.insecure_skip_verify {
            reqwest::Client::builder()
                .danger_accept_invalid_certs(true)
                .build()?
        } else {
            reqwest::Client::new()
        };

        Ok(Self {
            client,
            config,
            cache: None,
        })
    }

    /// Enable caching with the specified cache instance.
    pub fn with_cache(mut self, cache: Arc<EmbeddingCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    fn prefixed(&self, mode: EncodeMode, text: &str) -> String {
        match mode {
            EncodeMode::Query => format!("{}{}", self.config.query_prefix, text),
            EncodeMode::Passage => format!("{}{}", self.config.passage_prefix, text),
        }
    }

    /// Call the endpoint, bypassing the cache.
    async fn embed_uncached(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            input: serde_json::Value::String(text.to_string()),
            model: self.config.model.clone(),
        };

        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.config.base_url))
            .json(&request)
            .send()
            .await
            .context("Failed to call embedding service")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Embedding service returned status {}: {}", status, body);
        }

        let embedding_response: EmbeddingResponse = response
            .json()
            .await
            .context("Failed to parse embedding response")?;

        if embedding_response.data.is_empty() {
            anyhow::bail!("No embedding data in response");
        }

        let embedding = embedding_response.data[0].embedding.clone();

        if embedding.len() != self.config.dimensions {
            anyhow::bail!(
                "Expected embedding dimension {}, got {}",
                self.config.dimensions,
                embedding.len()
            );
        }

        Ok(embedding)
    }

    async fn embed_one(&self, mode: EncodeMode, text: &str) -> Result<Vec<f32>> {
        if let Some(cache) = &self.cache {
            if let Some(vector) = cache.get(mode, text).await? {
                return Ok(vector);
            }
        }

        let vector = self.embed_uncached(&self.prefixed(mode, text)).await?;

        if let Some(cache) = &self.cache {
            cache.put(mode, text, vector.clone()).await?;
        }

        Ok(vector)
    }
}

#[async_trait::async_trait]
impl Embedder for HttpEmbedder {
    async fn encode(&self, mode: EncodeMode, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        // Per-text requests leverage the cache; server-side batching is not
        // worth the cache misses for repeated canonical strings.
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed_one(mode, text).await?);
        }
        Ok(vectors)
    }

    fn dimensions(&self) -> usize {
        self.config.dimensions
    }
}

/// Bounded-concurrency encoder for large ingestion batches. Preserves input
/// order in the output.
pub struct ParallelEncoder {
    embedder: Arc<dyn Embedder>,
    semaphore: Arc<Semaphore>,
    batch_size: usize,
}

impl ParallelEncoder {
    pub fn new(embedder: Arc<dyn Embedder>, max_workers: usize, batch_size: usize) -> Self {
        Self {
            embedder,
            semaphore: Arc::new(Semaphore::new(max_workers.max(1))),
            batch_size: batch_size.max(1),
        }
    }

    pub async fn encode(&self, mode: EncodeMode, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        use futures::stream::{FuturesUnordered, StreamExt};

        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut tasks = FuturesUnordered::new();

        for (chunk_idx, batch) in texts.chunks(self.batch_size).enumerate() {
            let permit = self.semaphore.clone().acquire_owned().await?;
            let embedder = self.embedder.clone();
            let batch_owned: Vec<String> = batch.to_vec();
            let offset = chunk_idx * self.batch_size;

            tasks.push(tokio::spawn(async move {
                let batch_refs: Vec<&str> = batch_owned.iter().map(|s| s.as_str()).collect();
                let result = embedder.encode(mode, &batch_refs).await;
                drop(permit); // Release worker slot
                result.map(|vectors| (offset, vectors))
            }));
        }

        let mut slots: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        while let Some(joined) = tasks.next().await {
            let (offset, vectors) = joined??;
            for (i, vector) in vectors.into_iter().enumerate() {
                slots[offset + i] = Some(vector);
            }
        }

        slots
            .into_iter()
            .map(|s| s.context("embedding batch returned too few vectors"))
            .collect()
    }

    pub fn dimensions(&self) -> usize {
        self.embedder.dimensions()
    }
}
