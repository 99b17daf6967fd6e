//! Memory retrieval orchestrator
//!
//! Assembles a bundle from every memory layer in parallel — profile,
//! current task, recent events, latest summary, semantic search — then
//! trims each layer to its token budget and renders the bundle into a
//! markdown section for the system prompt.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use super::cache::MemoryCache;
use super::embedding::Embedder;
use super::events::{EventQuery, EventStore, MemoryEvent};
use super::profile::{ProfileItem, ProfileStore};
use super::semantic::{ScoredChunk, SearchOptions, SemanticStore};
use super::summarizer::{Summary, SummaryStore};
use super::tasks::{TaskState, TaskStore};
use crate::agent::prompts::PromptTemplate;
use crate::error::Result;

/// Rough token estimate: one token per four characters, rounded up
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// Per-layer token budgets
#[derive(Debug, Clone)]
pub struct RetrievalBudget {
    pub profile: u64,
    pub task: u64,
    pub events: u64,
    pub chunks: u64,
    pub summary: u64,
    /// Aggregate cap across all layers
    pub total: u64,
}

impl Default for RetrievalBudget {
    fn default() -> Self {
        RetrievalBudget {
            profile: 300,
            task: 400,
            events: 800,
            chunks: 800,
            summary: 300,
            total: 2_000,
        }
    }
}

/// Retrieval request
#[derive(Debug, Clone, Default)]
pub struct RetrievalRequest {
    pub session_id: Option<String>,
    pub query: Option<String>,
    pub budget: Option<RetrievalBudget>,
}

/// Everything retrieved for one prompt
#[derive(Debug, Clone)]
pub struct MemoryBundle {
    pub profile: Vec<ProfileItem>,
    pub task_state: Option<TaskState>,
    pub recent_events: Vec<MemoryEvent>,
    pub retrieved_chunks: Vec<ScoredChunk>,
    pub summary: Option<Summary>,
    pub warnings: Vec<String>,
    pub total_tokens: u64,
    pub timestamp: DateTime<Utc>,
}

/// Retriever configuration
#[derive(Debug, Clone)]
pub struct RetrieverConfig {
    /// Cap on recent events
    pub max_recent_events: u32,
    /// Recency window
    pub recent_window: Duration,
    /// Disable the semantic layer entirely
    pub semantic_enabled: bool,
    /// Task states older than this are flagged stale
    pub stale_after: Duration,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        RetrieverConfig {
            max_recent_events: 20,
            recent_window: Duration::minutes(30),
            semantic_enabled: true,
            stale_after: Duration::hours(24),
        }
    }
}

/// Orchestrates retrieval across all memory layers
#[derive(Clone)]
pub struct MemoryRetriever {
    events: EventStore,
    tasks: TaskStore,
    profile: ProfileStore,
    semantic: SemanticStore,
    summaries: SummaryStore,
    embedder: Option<Arc<dyn Embedder>>,
    cache: MemoryCache,
    config: RetrieverConfig,
}

impl MemoryRetriever {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        events: EventStore,
        tasks: TaskStore,
        profile: ProfileStore,
        semantic: SemanticStore,
        summaries: SummaryStore,
        embedder: Option<Arc<dyn Embedder>>,
        config: RetrieverConfig,
    ) -> Self {
        MemoryRetriever {
            events,
            tasks,
            profile,
            semantic,
            summaries,
            embedder,
            cache: MemoryCache::new(),
            config,
        }
    }

    /// Retrieve a trimmed memory bundle
    pub async fn retrieve(&self, request: &RetrievalRequest) -> Result<MemoryBundle> {
        let budget = request.budget.clone().unwrap_or_default();
        let session_id = request.session_id.as_deref();

        let event_query = EventQuery {
            session_id: request.session_id.clone(),
            since: Some(Utc::now() - self.config.recent_window),
            limit: Some(self.config.max_recent_events),
            ..Default::default()
        };

        let (profile, task_state, recent_events, summary, chunks) = tokio::join!(
            self.profile.all(),
            self.tasks.get_current(session_id),
            self.events.query(&event_query),
            self.latest_summary(session_id),
            self.search_chunks(session_id, request.query.as_deref()),
        );

        let profile = profile.unwrap_or_else(|e| {
            warn!("Profile retrieval failed: {}", e);
            Vec::new()
        });
        let task_state = task_state.unwrap_or_else(|e| {
            warn!("Task retrieval failed: {}", e);
            None
        });
        let recent_events = recent_events.unwrap_or_else(|e| {
            warn!("Event retrieval failed: {}", e);
            Vec::new()
        });
        let summary = summary.unwrap_or_else(|e| {
            warn!("Summary retrieval failed: {}", e);
            None
        });
        let chunks = chunks.unwrap_or_else(|e| {
            warn!("Semantic retrieval failed: {}", e);
            Vec::new()
        });

        let mut warnings = Vec::new();
        let mut total_tokens = 0u64;

        // Trim each layer to its budget, in priority order.
        let profile = trim_layer(profile, budget.profile, &mut total_tokens, |item| {
            estimate_tokens(&item.key) + estimate_tokens(&item.value.to_string())
        });

        let task_state = task_state.filter(|task| {
            let cost = estimate_tokens(&task.goal)
                + task
                    .plan
                    .iter()
                    .map(|s| estimate_tokens(&s.description))
                    .sum::<u64>();
            if cost <= budget.task {
                total_tokens += cost;
                true
            } else {
                false
            }
        });

        if let Some(ref task) = task_state {
            if Utc::now() - task.updated_at > self.config.stale_after {
                warnings.push("stale".to_string());
            }
        }

        let recent_events = trim_layer(recent_events, budget.events, &mut total_tokens, |e| {
            estimate_tokens(e.summary.as_deref().unwrap_or(""))
                + estimate_tokens(&e.payload.to_string())
        });

        let retrieved_chunks = trim_layer(chunks, budget.chunks, &mut total_tokens, |s| {
            estimate_tokens(&s.chunk.text)
        });

        let summary = summary.filter(|s| {
            let cost = estimate_tokens(&s.short)
                + s.bullets.iter().map(|b| estimate_tokens(b)).sum::<u64>();
            if cost <= budget.summary {
                total_tokens += cost;
                true
            } else {
                false
            }
        });

        if total_tokens > budget.total {
            warnings.push("overflow".to_string());
        }

        debug!(
            "Retrieved memory bundle: {} profile, {} events, {} chunks, ~{} tokens",
            profile.len(),
            recent_events.len(),
            retrieved_chunks.len(),
            total_tokens
        );

        Ok(MemoryBundle {
            profile,
            task_state,
            recent_events,
            retrieved_chunks,
            summary,
            warnings,
            total_tokens,
            timestamp: Utc::now(),
        })
    }

    async fn latest_summary(&self, session_id: Option<&str>) -> Result<Option<Summary>> {
        match session_id {
            Some(session_id) => self.summaries.latest(session_id).await,
            None => Ok(None),
        }
    }

    async fn search_chunks(
        &self,
        session_id: Option<&str>,
        query: Option<&str>,
    ) -> Result<Vec<ScoredChunk>> {
        if !self.config.semantic_enabled {
            return Ok(Vec::new());
        }
        let Some(query) = query.filter(|q| !q.trim().is_empty()) else {
            return Ok(Vec::new());
        };

        let cache_session = session_id.unwrap_or("");
        if let Some(cached) = self.cache.get_search_results(cache_session, query).await {
            return Ok(cached);
        }

        let embedding = match self.embedder {
            Some(ref embedder) => match self.embed_cached(embedder, query).await {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("Query embedding failed, using FTS only: {}", e);
                    None
                }
            },
            None => None,
        };

        let opts = SearchOptions {
            session_id: session_id.map(str::to_string),
            ..Default::default()
        };
        let results = self
            .semantic
            .search(query, embedding.as_deref(), &opts)
            .await?;

        self.cache
            .put_search_results(cache_session, query, results.clone())
            .await;
        Ok(results)
    }

    async fn embed_cached(&self, embedder: &Arc<dyn Embedder>, text: &str) -> Result<Vec<f32>> {
        if let Some(cached) = self.cache.get_embedding(text).await {
            return Ok(cached);
        }
        let embedding = embedder.embed(text).await?;
        self.cache.put_embedding(text, embedding.clone()).await;
        Ok(embedding)
    }
}

/// Keep items while the layer budget holds
fn trim_layer<T>(
    items: Vec<T>,
    layer_budget: u64,
    total: &mut u64,
    cost: impl Fn(&T) -> u64,
) -> Vec<T> {
    let mut kept = Vec::new();
    let mut spent = 0u64;
    for item in items {
        let c = cost(&item);
        if spent + c > layer_budget {
            break;
        }
        spent += c;
        kept.push(item);
    }
    *total += spent;
    kept
}

const INJECT_TEMPLATE: &str = "\
## Memory Context

{{#if profile}}### What we know about the user
{{#each profile}}- {{this.key}}: {{this.value}}
{{/each}}
{{/if}}{{#if task}}### Current task
Goal: {{task.goal}} (status: {{task.status}}, v{{task.version}})
{{#each task.plan}}- [{{this.status}}] {{this.description}}
{{/each}}
{{/if}}{{#if summary}}### Session summary
{{summary.short}}
{{#each summary.bullets}}- {{this}}
{{/each}}
{{/if}}{{#if events}}### Recent activity
{{#each events}}- {{this}}
{{/each}}
{{/if}}{{#if chunks}}### Related memory
{{#each chunks}}- {{this}}
{{/each}}
{{/if}}";

#[derive(Serialize)]
struct InjectData<'a> {
    profile: Vec<serde_json::Value>,
    task: Option<&'a TaskState>,
    summary: Option<&'a Summary>,
    events: Vec<String>,
    chunks: Vec<String>,
}

/// Render a bundle into the markdown section prepended to the system
/// prompt.
pub fn inject(bundle: &MemoryBundle) -> Result<String> {
    let template = PromptTemplate::new("memory_inject", INJECT_TEMPLATE)?;

    let data = InjectData {
        profile: bundle
            .profile
            .iter()
            .map(|p| serde_json::json!({ "key": p.key, "value": p.value.to_string() }))
            .collect(),
        task: bundle.task_state.as_ref(),
        summary: bundle.summary.as_ref(),
        events: bundle
            .recent_events
            .iter()
            .map(|e| {
                format!(
                    "{}: {}",
                    e.event_type,
                    e.summary.as_deref().unwrap_or("(no summary)")
                )
            })
            .collect(),
        chunks: bundle
            .retrieved_chunks
            .iter()
            .map(|s| s.chunk.text.clone())
            .collect(),
    };

    template.render(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::db::init_pool_in_memory;
    use crate::memory::embedding::testing::HashEmbedder;
    use crate::memory::events::EventType;
    use crate::memory::profile::ProfileSetOptions;
    use crate::memory::semantic::SemanticChunk;

    async fn retriever() -> MemoryRetriever {
        let pool = init_pool_in_memory().await.unwrap();
        MemoryRetriever::new(
            EventStore::new(pool.clone()),
            TaskStore::new(pool.clone()),
            ProfileStore::new(pool.clone()),
            SemanticStore::with_dimension(pool.clone(), 8),
            SummaryStore::new(pool),
            Some(Arc::new(HashEmbedder { dim: 8 })),
            RetrieverConfig::default(),
        )
    }

    #[test]
    fn estimator_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[tokio::test]
    async fn bundle_collects_all_layers() {
        let r = retriever().await;

        r.profile
            .set("name", serde_json::json!("Sam"), ProfileSetOptions::default())
            .await
            .unwrap();
        let task = TaskState::new("s1", "finish the report");
        r.tasks.create(&task).await.unwrap();
        r.events
            .append(
                &MemoryEvent::new(EventType::UserMsg, "s1").with_summary("asked about the report"),
            )
            .await
            .unwrap();
        r.semantic
            .add(
                &SemanticChunk::new("the report deadline is friday")
                    .with_session("s1")
                    .with_embedding(
                        HashEmbedder { dim: 8 }
                            .embed("the report deadline is friday")
                            .await
                            .unwrap(),
                    ),
            )
            .await
            .unwrap();

        let bundle = r
            .retrieve(&RetrievalRequest {
                session_id: Some("s1".into()),
                query: Some("report deadline".into()),
                budget: None,
            })
            .await
            .unwrap();

        assert_eq!(bundle.profile.len(), 1);
        assert!(bundle.task_state.is_some());
        assert_eq!(bundle.recent_events.len(), 1);
        assert_eq!(bundle.retrieved_chunks.len(), 1);
        assert!(bundle.total_tokens > 0);
    }

    #[tokio::test]
    async fn trimming_respects_layer_budget_and_flags_overflow() {
        let r = retriever().await;
        for i in 0..50 {
            r.events
                .append(
                    &MemoryEvent::new(EventType::UserMsg, "s1")
                        .with_summary(format!("a moderately long event summary number {}", i)),
                )
                .await
                .unwrap();
        }

        let bundle = r
            .retrieve(&RetrievalRequest {
                session_id: Some("s1".into()),
                budget: Some(RetrievalBudget {
                    events: 40,
                    total: 10,
                    ..Default::default()
                }),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(bundle.recent_events.len() < 50);
        assert!(bundle.warnings.contains(&"overflow".to_string()));
    }

    #[tokio::test]
    async fn stale_task_is_flagged() {
        let r = retriever().await;
        let mut task = TaskState::new("s1", "old goal");
        task.updated_at = Utc::now() - Duration::hours(48);
        task.created_at = task.updated_at;
        r.tasks.create(&task).await.unwrap();

        let bundle = r
            .retrieve(&RetrievalRequest {
                session_id: Some("s1".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(bundle.warnings.contains(&"stale".to_string()));
    }

    #[tokio::test]
    async fn inject_renders_marked_sections() {
        let r = retriever().await;
        r.profile
            .set(
                "language",
                serde_json::json!("rust"),
                ProfileSetOptions::default(),
            )
            .await
            .unwrap();

        let bundle = r.retrieve(&RetrievalRequest::default()).await.unwrap();
        let section = inject(&bundle).unwrap();
        assert!(section.starts_with("## Memory Context"));
        assert!(section.contains("language"));
    }

    #[tokio::test]
    async fn semantic_layer_skipped_without_query() {
        let r = retriever().await;
        r.semantic
            .add(&SemanticChunk::new("some indexed fact").with_session("s1"))
            .await
            .unwrap();

        let bundle = r
            .retrieve(&RetrievalRequest {
                session_id: Some("s1".into()),
                query: None,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(bundle.retrieved_chunks.is_empty());
    }
}
