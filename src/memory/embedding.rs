//! Embedding model seam
//!
//! Embedding generation is an external collaborator; the store only
//! cares that vectors arrive with the configured dimensionality.

use async_trait::async_trait;

use crate::error::Result;

/// Produces fixed-dimension embeddings for text
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate an embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts.
    ///
    /// The default implementation embeds sequentially.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Dimensionality of produced vectors
    fn dimensions(&self) -> usize;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Deterministic embedder for tests: hashes words into a small
    /// fixed-size vector.
    pub struct HashEmbedder {
        pub dim: usize,
    }

    #[async_trait]
    impl Embedder for HashEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut v = vec![0.0_f32; self.dim];
            for (i, word) in text.split_whitespace().enumerate() {
                let mut h = 0usize;
                for b in word.bytes() {
                    h = h.wrapping_mul(31).wrapping_add(b as usize);
                }
                v[(h + i) % self.dim] += 1.0;
            }
            Ok(v)
        }

        fn dimensions(&self) -> usize {
            self.dim
        }
    }

    #[tokio::test]
    async fn hash_embedder_is_deterministic() {
        let embedder = HashEmbedder { dim: 8 };
        let a = embedder.embed("hello world").await.unwrap();
        let b = embedder.embed("hello world").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
    }
}
