//! Embedding Service
//!
//! Turns task text into fixed-dimension vectors when a caller supplies none.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use remem_common::{normalize_task, RememError, ValidationError};
use remem_index::distance::normalize;

/// Text-to-vector seam used when a request carries no embedding
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Embed one task text
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed several texts in order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed_text(text).await?);
        }
        Ok(results)
    }

    /// Length of every vector produced
    fn dimension(&self) -> usize;
}

/// Embedding failures
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl From<EmbeddingError> for RememError {
    fn from(err: EmbeddingError) -> Self {
        match err {
            EmbeddingError::InvalidInput(_) => RememError::Validation(ValidationError::EmptyTask),
            EmbeddingError::Unavailable(msg) => RememError::Internal(format!("Embedding: {}", msg)),
        }
    }
}

/// Local embedding from hashed character trigrams
///
/// Deterministic and dependency-free; similar strings land close together.
/// Output is L2-normalised.
pub struct LocalEmbedding {
    dimension: usize,
    cache: RwLock<HashMap<String, Vec<f32>>>,
    cache_size_limit: usize,
}

impl LocalEmbedding {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            cache: RwLock::new(HashMap::new()),
            cache_size_limit: 10_000,
        }
    }

    /// FNV-1a over the trigram bytes
    fn hash_trigram(trigram: &[u8]) -> u64 {
        trigram.iter().fold(0xcbf2_9ce4_8422_2325u64, |h, &b| {
            (h ^ b as u64).wrapping_mul(0x0100_0000_01b3)
        })
    }

    fn generate(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0f32; self.dimension];
        let padded = format!(" {} ", text);
        let bytes = padded.as_bytes();

        for trigram in bytes.windows(3) {
            let h = Self::hash_trigram(trigram);
            let idx = (h % self.dimension as u64) as usize;
            // Sign bit spreads collisions around zero
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            embedding[idx] += sign;
        }

        normalize(&mut embedding);
        embedding
    }
}

impl Default for LocalEmbedding {
    fn default() -> Self {
        Self::new(crate::DEFAULT_EMBEDDING_DIMENSION)
    }
}

#[async_trait]
impl EmbeddingService for LocalEmbedding {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let key = normalize_task(text);
        if key.is_empty() {
            return Err(EmbeddingError::InvalidInput("empty text".into()));
        }

        if let Some(embedding) = self.cache.read().get(&key) {
            return Ok(embedding.clone());
        }

        let embedding = self.generate(&key);

        let mut cache = self.cache.write();
        if cache.len() < self.cache_size_limit {
            cache.insert(key, embedding.clone());
        }

        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
