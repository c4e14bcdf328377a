//! Embedding backends for the semantic lens.
//!
//! The lens only depends on the [`Embedder`] seam; which model produces the
//! vectors is deployment configuration. The default backend derives
//! deterministic pseudo-embeddings from SHA-256, which keeps replay-parity
//! tests runnable without a model runtime. Real vector values are never part
//! of the determinism hash (model identity is), so swapping backends does
//! not break parity.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::sdk::LensError;

/// Embedding vector type.
pub type Embedding = Vec<f32>;

/// Trait for text embedding backends.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate an embedding for the text as rendered by a template.
    async fn embed(&self, template_id: &str, text: &str) -> Result<Embedding, LensError>;

    /// Model identifier for storage and the determinism hash.
    fn model_id(&self) -> &str;

    fn model_version(&self) -> &str;

    /// Embedding dimension.
    fn dimension(&self) -> usize;
}

/// Shared embedder handle.
pub type SharedEmbedder = Arc<dyn Embedder>;

/// Deterministic SHA-256-derived embeddings.
///
/// Each vector component comes from a counter-mode hash of
/// `template_id\ntext`, mapped into `[-1, 1]`. Not semantically meaningful;
/// byte-stable across runs and platforms, which is exactly what the replay
/// tests need.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    model_id: String,
    model_version: String,
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            model_id: "hash-embed".to_string(),
            model_version: "1".to_string(),
            dimension,
        }
    }

    pub fn with_identity(
        model_id: impl Into<String>,
        model_version: impl Into<String>,
        dimension: usize,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            model_version: model_version.into(),
            dimension,
        }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, template_id: &str, text: &str) -> Result<Embedding, LensError> {
        let mut vector = Vec::with_capacity(self.dimension);
        let mut counter = 0u32;
        'outer: loop {
            let mut hasher = Sha256::new();
            hasher.update(template_id.as_bytes());
            hasher.update(b"\n");
            hasher.update(text.as_bytes());
            hasher.update(counter.to_be_bytes());
            let digest = hasher.finalize();
            for chunk in digest.chunks_exact(4) {
                if vector.len() == self.dimension {
                    break 'outer;
                }
                let raw = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                vector.push((raw as f32 / u32::MAX as f32) * 2.0 - 1.0);
            }
            counter += 1;
        }
        Ok(vector)
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn model_version(&self) -> &str {
        &self.model_version
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
