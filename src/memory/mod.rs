//! Memory: persistent stores, retrieval, summarization, compaction

pub mod cache;
pub mod compaction;
pub mod db;
pub mod embedding;
pub mod events;
pub mod profile;
pub mod retriever;
pub mod semantic;
pub mod summarizer;
pub mod tasks;

pub use cache::MemoryCache;
pub use compaction::{CompactionConfig, CompactionManager, ContextHealth};
pub use db::MemoryPool;
pub use embedding::Embedder;
pub use events::{EventQuery, EventStore, EventType, MemoryEvent};
pub use profile::{ProfileItem, ProfileSetOptions, ProfileStore};
pub use retriever::{
    inject, MemoryBundle, MemoryRetriever, RetrievalBudget, RetrievalRequest, RetrieverConfig,
};
pub use semantic::{ScoredChunk, SearchOptions, SemanticChunk, SemanticStore};
pub use summarizer::{Summarizer, SummarizerLimits, Summary, SummaryStore, TodoItem};
pub use tasks::{TaskPatch, TaskState, TaskStatus, TaskStep, TaskStore};

use std::sync::Arc;

use crate::error::Result;

/// One handle over every memory store, sharing a single pool
#[derive(Clone)]
pub struct MemoryManager {
    pub events: EventStore,
    pub tasks: TaskStore,
    pub profile: ProfileStore,
    pub semantic: SemanticStore,
    pub summaries: SummaryStore,
    pub retriever: MemoryRetriever,
    pub summarizer: Summarizer,
}

impl MemoryManager {
    /// Open (or create) the database at `path` and wire up all stores
    pub async fn open(path: &str, embedder: Option<Arc<dyn Embedder>>) -> Result<Self> {
        let pool = db::init_pool(path).await?;
        Ok(Self::from_pool(pool, embedder))
    }

    /// Ephemeral in-memory instance
    pub async fn open_in_memory(embedder: Option<Arc<dyn Embedder>>) -> Result<Self> {
        let pool = db::init_pool_in_memory().await?;
        Ok(Self::from_pool(pool, embedder))
    }

    fn from_pool(pool: MemoryPool, embedder: Option<Arc<dyn Embedder>>) -> Self {
        let events = EventStore::new(pool.clone());
        let tasks = TaskStore::new(pool.clone());
        let profile = ProfileStore::new(pool.clone());
        let semantic = match embedder.as_ref() {
            Some(e) => SemanticStore::with_dimension(pool.clone(), e.dimensions()),
            None => SemanticStore::new(pool.clone()),
        };
        let summaries = SummaryStore::new(pool);

        let retriever = MemoryRetriever::new(
            events.clone(),
            tasks.clone(),
            profile.clone(),
            semantic.clone(),
            summaries.clone(),
            embedder,
            RetrieverConfig::default(),
        );

        MemoryManager {
            events,
            tasks,
            profile,
            semantic,
            summaries,
            retriever,
            summarizer: Summarizer::default(),
        }
    }
}
