//! Deterministic stand-ins for the external embedding and merge services.

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::embedder::{Embedder, EncodeMode};
use crate::merge::MergeProvider;

/// Embedder with an explicit text -> vector vocabulary. Texts outside the
/// vocabulary get a hash-derived vector, stable across runs.
pub struct StubEmbedder {
    dims: usize,
    vocab: HashMap<String, Vec<f32>>,
}

impl StubEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            vocab: HashMap::new(),
        }
    }

    pub fn define(mut self, text: &str, vector: Vec<f32>) -> Self {
        assert_eq!(vector.len(), self.dims, "vocabulary vector has wrong size");
        self.vocab.insert(text.to_string(), vector);
        self
    }

    fn fallback(&self, text: &str) -> Vec<f32> {
        let digest = Sha256::digest(text.as_bytes());
        let mut vector: Vec<f32> = digest
            .iter()
            .cycle()
            .take(self.dims)
            .map(|b| *b as f32 / 255.0 + 0.01)
            .collect();
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        for x in &mut vector {
            *x /= norm;
        }
        vector
    }
}

#[async_trait]
impl Embedder for StubEmbedder {
    async fn encode(&self, _mode: EncodeMode, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| self.vocab.get(*t).cloned().unwrap_or_else(|| self.fallback(t)))
            .collect())
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// Merger that joins both inputs, so merged summaries are predictable.
pub struct StubMerger;

#[async_trait]
impl MergeProvider for StubMerger {
    async fn merge(&self, existing: &str, incoming: &str, _context: &str) -> Result<String> {
        Ok(format!("{}; {}", existing, incoming))
    }
}

/// Merger whose backend is always down.
pub struct FailingMerger;

#[async_trait]
impl MergeProvider for FailingMerger {
    async fn merge(&self, _existing: &str, _incoming: &str, _context: &str) -> Result<String> {
        anyhow::bail!("merge backend offline")
    }
}
