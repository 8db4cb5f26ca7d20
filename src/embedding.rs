//! Embedding provider abstraction.
//!
//! The [`Embedder`] trait is the seam between the ingestion pipeline and
//! whatever produces embedding vectors. Remote model providers are
//! external collaborators; the crate ships [`HashEmbedder`], a
//! deterministic bag-of-words feature hasher that needs no network and
//! keeps the ingestion and search paths fully testable.

use sha2::{Digest, Sha256};

/// Produces embedding vectors for batches of texts.
pub trait Embedder: Send + Sync {
    /// Vector dimensionality.
    fn dims(&self) -> usize;

    /// Embed a batch of texts, one vector per input, in order.
    fn embed(&self, texts: &[String]) -> Vec<Vec<f32>>;
}

/// Deterministic local embedder based on token feature hashing.
///
/// Each whitespace token is hashed into one of `dims` buckets; the bucket
/// vector is L2-normalized. Texts sharing vocabulary land near each other,
/// which is enough signal for retrieval over small corpora and for tests.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

impl Embedder for HashEmbedder {
    fn dims(&self) -> usize {
        self.dims
    }

    fn embed(&self, texts: &[String]) -> Vec<Vec<f32>> {
        texts.iter().map(|t| self.embed_one(t)).collect()
    }
}

impl HashEmbedder {
    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dims];
        for token in text.to_lowercase().split_whitespace() {
            let trimmed = token.trim_matches(|c: char| !c.is_alphanumeric());
            if trimmed.is_empty() {
                continue;
            }
            let mut hasher = Sha256::new();
            hasher.update(trimmed.as_bytes());
            let digest = hasher.finalize();
            let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
                % self.dims;
            // Second digest byte range picks the sign, spreading collisions.
            let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let magnitude: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if magnitude > f32::EPSILON {
            for v in vector.iter_mut() {
                *v /= magnitude;
            }
        }
        vector
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::cosine_sim;

    #[test]
    fn test_embed_is_deterministic() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed(&["alpha beta gamma".to_string()]);
        let b = embedder.embed(&["alpha beta gamma".to_string()]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_embed_dims_and_normalization() {
        let embedder = HashEmbedder::new(32);
        let vectors = embedder.embed(&["deployment runbook".to_string()]);
        assert_eq!(vectors[0].len(), 32);
        let magnitude: f32 = vectors[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_shared_vocabulary_scores_higher() {
        let embedder = HashEmbedder::new(64);
        let vectors = embedder.embed(&[
            "kubernetes deployment guide".to_string(),
            "kubernetes deployment notes".to_string(),
            "gardening tips for spring".to_string(),
        ]);
        let near = cosine_sim(&vectors[0], &vectors[1]);
        let far = cosine_sim(&vectors[0], &vectors[2]);
        assert!(near > far);
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let embedder = HashEmbedder::new(16);
        let vectors = embedder.embed(&["".to_string()]);
        assert!(vectors[0].iter().all(|v| *v == 0.0));
    }
}
