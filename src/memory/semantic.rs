//! Semantic chunk store with hybrid FTS + vector search
//!
//! Chunks live in a base table mirrored into an FTS5 index and a
//! vector table by triggers (see `memory::db`). Full-text search ranks
//! by BM25; vector search is k-nearest-neighbor on cosine distance,
//! computed in-process over the mirrored vectors (bundled SQLite ships
//! no vector virtual table, and the in-memory fallback is exact).
//! Hybrid search max-normalizes each score set before weighting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use super::db::{blob_to_embedding, embedding_to_blob, MemoryPool};
use crate::error::{Error, Result};

/// Default embedding dimensionality
pub const DEFAULT_EMBEDDING_DIM: usize = 1536;

/// A chunk of text indexed for retrieval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticChunk {
    pub id: Uuid,
    pub text: String,
    pub tags: Vec<String>,
    pub session_id: Option<String>,
    pub source_event_id: Option<Uuid>,
    pub source_type: Option<String>,
    /// Fixed-dimension embedding, absent until embedded
    pub embedding: Option<Vec<f32>>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl SemanticChunk {
    pub fn new(text: impl Into<String>) -> Self {
        SemanticChunk {
            id: Uuid::new_v4(),
            text: text.into(),
            tags: Vec::new(),
            session_id: None,
            source_event_id: None,
            source_type: None,
            embedding: None,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_source(mut self, source_type: impl Into<String>) -> Self {
        self.source_type = Some(source_type.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// A chunk plus its retrieval score
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: SemanticChunk,
    pub score: f64,
}

/// Weights for combining FTS and vector scores
#[derive(Debug, Clone, Copy)]
pub struct HybridWeights {
    pub fts: f64,
    pub vector: f64,
}

impl Default for HybridWeights {
    fn default() -> Self {
        HybridWeights {
            fts: 0.3,
            vector: 0.7,
        }
    }
}

/// Search filters and limits
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub limit: usize,
    pub session_id: Option<String>,
    pub tags: Vec<String>,
    pub source_type: Option<String>,
    pub weights: HybridWeights,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            limit: 10,
            session_id: None,
            tags: Vec::new(),
            source_type: None,
            weights: HybridWeights::default(),
        }
    }
}

/// Semantic store backed by SQLite FTS5 + mirrored vectors
#[derive(Clone)]
pub struct SemanticStore {
    pool: MemoryPool,
    dim: usize,
}

impl SemanticStore {
    /// Create a store with the default embedding dimensionality
    pub fn new(pool: MemoryPool) -> Self {
        Self::with_dimension(pool, DEFAULT_EMBEDDING_DIM)
    }

    /// Create a store with a fixed embedding dimensionality
    pub fn with_dimension(pool: MemoryPool, dim: usize) -> Self {
        SemanticStore { pool, dim }
    }

    /// The configured embedding dimensionality
    pub fn dimension(&self) -> usize {
        self.dim
    }

    /// Insert a chunk. The FTS and vector mirrors are maintained by
    /// triggers; an embedding of the wrong dimensionality is rejected.
    pub async fn add(&self, chunk: &SemanticChunk) -> Result<()> {
        if let Some(ref embedding) = chunk.embedding {
            if embedding.len() != self.dim {
                return Err(Error::DimensionMismatch {
                    expected: self.dim,
                    actual: embedding.len(),
                });
            }
        }

        sqlx::query(
            r#"
            INSERT INTO semantic_chunks
                (id, text, tags, session_id, source_event_id, source_type, embedding, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(chunk.id.to_string())
        .bind(&chunk.text)
        .bind(serde_json::to_string(&chunk.tags)?)
        .bind(&chunk.session_id)
        .bind(chunk.source_event_id.map(|id| id.to_string()))
        .bind(&chunk.source_type)
        .bind(chunk.embedding.as_ref().map(|e| embedding_to_blob(e)))
        .bind(serde_json::to_string(&chunk.metadata)?)
        .bind(chunk.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a chunk by ID
    pub async fn get(&self, id: Uuid) -> Result<Option<SemanticChunk>> {
        let row = sqlx::query("SELECT * FROM semantic_chunks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_chunk(&r)).transpose()
    }

    /// Delete a chunk (mirrors cleaned by triggers)
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM semantic_chunks WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete every chunk of a session, including its vector rows
    pub async fn delete_session(&self, session_id: &str) -> Result<u64> {
        let affected = sqlx::query("DELETE FROM semantic_chunks WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected)
    }

    /// Full-text search ranked by BM25.
    ///
    /// The query is tokenized into prefix tokens combined AND-first,
    /// OR-fallback, so all-term matches rank above any-term matches.
    /// FTS5 reports BM25 as negative-better, so the sign is inverted.
    pub async fn search_fts(&self, query: &str, opts: &SearchOptions) -> Result<Vec<ScoredChunk>> {
        let Some(match_expr) = build_match_expr(query) else {
            return Ok(Vec::new());
        };

        let mut sql = String::from(
            r#"
            SELECT c.*, bm25(semantic_chunks_fts) AS rank
            FROM semantic_chunks_fts
            JOIN semantic_chunks c ON c.rowid = semantic_chunks_fts.rowid
            WHERE semantic_chunks_fts MATCH ?
            "#,
        );
        push_filters(&mut sql, opts);
        sql.push_str(" ORDER BY rank LIMIT ?");

        let mut q = sqlx::query(&sql).bind(&match_expr);
        q = bind_filters(q, opts);
        q = q.bind(opts.limit as i64);

        let rows = q.fetch_all(&self.pool).await?;
        debug!("FTS search '{}' matched {} chunks", match_expr, rows.len());

        rows.iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                Ok(ScoredChunk {
                    chunk: row_to_chunk(row)?,
                    score: -rank,
                })
            })
            .collect()
    }

    /// Vector k-NN on cosine distance, scored as `1 / (1 + distance)`.
    pub async fn search_vector(
        &self,
        embedding: &[f32],
        opts: &SearchOptions,
    ) -> Result<Vec<ScoredChunk>> {
        if embedding.len() != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                actual: embedding.len(),
            });
        }

        let mut sql = String::from(
            r#"
            SELECT c.*, v.embedding AS vec_blob
            FROM semantic_chunks_vec v
            JOIN semantic_chunks c ON c.id = v.chunk_id
            WHERE 1 = 1
            "#,
        );
        push_filters(&mut sql, opts);

        let mut q = sqlx::query(&sql);
        q = bind_filters(q, opts);
        let rows = q.fetch_all(&self.pool).await?;

        let mut scored: Vec<ScoredChunk> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("vec_blob");
                let candidate = blob_to_embedding(&blob);
                let distance = cosine_distance(embedding, &candidate);
                Ok(ScoredChunk {
                    chunk: row_to_chunk(row)?,
                    score: 1.0 / (1.0 + distance),
                })
            })
            .collect::<Result<_>>()?;

        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(opts.limit);
        Ok(scored)
    }

    /// Hybrid search: FTS and vector sides run at twice the limit,
    /// each score set is divided by its own max, and combined per
    /// chunk as `w_fts * fts + w_vec * vec` (a missing side counts 0).
    ///
    /// Per-side max normalization preserves the upstream behavior: a
    /// very small vector result set can dominate after scaling.
    pub async fn search(
        &self,
        query: &str,
        query_embedding: Option<&[f32]>,
        opts: &SearchOptions,
    ) -> Result<Vec<ScoredChunk>> {
        let mut wide = opts.clone();
        wide.limit = opts.limit * 2;

        let fts_results = self.search_fts(query, &wide).await?;
        let vec_results = match query_embedding {
            Some(embedding) => self.search_vector(embedding, &wide).await?,
            None => Vec::new(),
        };

        let fts_max = fts_results.iter().map(|s| s.score).fold(0.0_f64, f64::max);
        let vec_max = vec_results.iter().map(|s| s.score).fold(0.0_f64, f64::max);

        let mut combined: std::collections::HashMap<Uuid, (Option<SemanticChunk>, f64)> =
            std::collections::HashMap::new();

        for s in fts_results {
            let norm = if fts_max > 0.0 { s.score / fts_max } else { 0.0 };
            let entry = combined.entry(s.chunk.id).or_insert((None, 0.0));
            entry.0.get_or_insert(s.chunk);
            entry.1 += opts.weights.fts * norm;
        }
        for s in vec_results {
            let norm = if vec_max > 0.0 { s.score / vec_max } else { 0.0 };
            let entry = combined.entry(s.chunk.id).or_insert((None, 0.0));
            entry.0.get_or_insert(s.chunk);
            entry.1 += opts.weights.vector * norm;
        }

        let mut results: Vec<ScoredChunk> = combined
            .into_values()
            .filter_map(|(chunk, score)| chunk.map(|c| ScoredChunk { chunk: c, score }))
            .collect();
        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        results.truncate(opts.limit);
        Ok(results)
    }
}

/// Build an FTS5 MATCH expression from free text.
///
/// `"agent memory"` becomes `("agent"* AND "memory"*) OR "agent"* OR "memory"*`.
fn build_match_expr(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"*", t.to_lowercase()))
        .collect();

    match tokens.len() {
        0 => None,
        1 => Some(tokens.into_iter().next().unwrap()),
        _ => Some(format!(
            "({}) OR {}",
            tokens.join(" AND "),
            tokens.join(" OR ")
        )),
    }
}

fn push_filters(sql: &mut String, opts: &SearchOptions) {
    if opts.session_id.is_some() {
        sql.push_str(" AND c.session_id = ?");
    }
    if opts.source_type.is_some() {
        sql.push_str(" AND c.source_type = ?");
    }
    if !opts.tags.is_empty() {
        sql.push_str(&format!(
            " AND EXISTS (SELECT 1 FROM json_each(c.tags) WHERE json_each.value IN ({}))",
            vec!["?"; opts.tags.len()].join(", ")
        ));
    }
}

fn bind_filters<'q>(
    mut q: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    opts: &'q SearchOptions,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    if let Some(ref session_id) = opts.session_id {
        q = q.bind(session_id);
    }
    if let Some(ref source_type) = opts.source_type {
        q = q.bind(source_type);
    }
    for tag in &opts.tags {
        q = q.bind(tag);
    }
    q
}

/// Cosine distance (`1 - similarity`); orthogonal or empty vectors
/// yield the maximum distance of 1.
fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Result<SemanticChunk> {
    let id: String = row.get("id");
    let tags: String = row.get("tags");
    let source_event_id: Option<String> = row.get("source_event_id");
    let embedding: Option<Vec<u8>> = row.get("embedding");
    let metadata: String = row.get("metadata");

    Ok(SemanticChunk {
        id: Uuid::parse_str(&id).map_err(|e| Error::Internal(format!("Bad chunk id: {}", e)))?,
        text: row.get("text"),
        tags: serde_json::from_str(&tags)?,
        session_id: row.get("session_id"),
        source_event_id: source_event_id
            .map(|id| Uuid::parse_str(&id))
            .transpose()
            .map_err(|e| Error::Internal(format!("Bad source event id: {}", e)))?,
        source_type: row.get("source_type"),
        embedding: embedding.map(|b| blob_to_embedding(&b)),
        metadata: serde_json::from_str(&metadata)?,
        created_at: row.get("created_at"),
    })
}
