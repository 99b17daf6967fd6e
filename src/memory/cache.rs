//! In-process caching for embeddings and semantic search results
//!
//! Uses moka async caches (Send + Sync, TTL-based eviction). No
//! external services required.

use moka::future::Cache;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;

use super::semantic::ScoredChunk;

/// Cache key helper: hash a string to u64
fn hash_key(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

/// In-process memory cache
#[derive(Clone)]
pub struct MemoryCache {
    /// Embedding cache: hash(text) -> embedding
    embeddings: Cache<u64, Vec<f32>>,
    /// Search result cache: hash(session + query) -> scored chunks
    search_results: Cache<u64, Vec<ScoredChunk>>,
}

impl MemoryCache {
    /// Create a new cache with default settings
    pub fn new() -> Self {
        MemoryCache {
            embeddings: Cache::builder()
                .max_capacity(1000)
                .time_to_live(Duration::from_secs(30 * 60))
                .build(),
            search_results: Cache::builder()
                .max_capacity(500)
                .time_to_live(Duration::from_secs(5 * 60))
                .build(),
        }
    }

    /// Get a cached embedding
    pub async fn get_embedding(&self, text: &str) -> Option<Vec<f32>> {
        self.embeddings.get(&hash_key(text)).await
    }

    /// Store an embedding in cache
    pub async fn put_embedding(&self, text: &str, embedding: Vec<f32>) {
        self.embeddings.insert(hash_key(text), embedding).await;
    }

    /// Get cached search results
    pub async fn get_search_results(&self, session_id: &str, query: &str) -> Option<Vec<ScoredChunk>> {
        let key = format!("{}:{}", session_id, query);
        self.search_results.get(&hash_key(&key)).await
    }

    /// Store search results in cache
    pub async fn put_search_results(
        &self,
        session_id: &str,
        query: &str,
        results: Vec<ScoredChunk>,
    ) {
        let key = format!("{}:{}", session_id, query);
        self.search_results.insert(hash_key(&key), results).await;
    }

    /// Invalidate all cached search results (e.g. after new chunks land).
    /// Moka has no prefix invalidation; the short TTL keeps this cheap.
    pub async fn invalidate_search(&self) {
        self.search_results.invalidate_all();
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn embedding_cache_round_trip() {
        let cache = MemoryCache::new();

        assert!(cache.get_embedding("hello").await.is_none());
        cache.put_embedding("hello", vec![0.1, 0.2, 0.3]).await;

        let result = cache.get_embedding("hello").await.unwrap();
        assert_eq!(result.len(), 3);
    }

    #[tokio::test]
    async fn search_cache_is_keyed_by_session_and_query() {
        let cache = MemoryCache::new();
        cache.put_search_results("s1", "query", vec![]).await;

        assert!(cache.get_search_results("s1", "query").await.is_some());
        assert!(cache.get_search_results("s2", "query").await.is_none());
        assert!(cache.get_search_results("s1", "other").await.is_none());
    }
}
