//! Embedded SQLite database connection and schema
//!
//! All memory stores share one pooled connection set. The semantic
//! chunk table is mirrored into an FTS5 index and a vector table by
//! `_ai`/`_ad`/`_au` triggers, so the three row sets can never drift.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::error::Result;

/// SQLite connection pool type alias
pub type MemoryPool = SqlitePool;

/// Initialize the SQLite connection pool for a database file
pub async fn init_pool(path: &str) -> Result<MemoryPool> {
    info!("Opening memory database at {}", path);

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))
        .map_err(sqlx::Error::from)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    migrations::run(&pool).await?;
    Ok(pool)
}

/// Initialize an in-memory pool (single connection, used by tests and
/// ephemeral sessions)
pub async fn init_pool_in_memory() -> Result<MemoryPool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;

    migrations::run(&pool).await?;
    Ok(pool)
}

/// Serialize an embedding into little-endian f32 bytes
pub fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for v in embedding {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

/// Deserialize little-endian f32 bytes back into an embedding
pub fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Database schema setup
pub mod migrations {
    use super::*;

    /// Run all migrations (idempotent)
    pub async fn run(pool: &MemoryPool) -> Result<()> {
        info!("Running memory database migrations");

        // Append-only event log
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                session_id TEXT NOT NULL,
                ts TEXT NOT NULL,
                intent TEXT,
                entities TEXT NOT NULL DEFAULT '[]',
                summary TEXT,
                payload TEXT NOT NULL DEFAULT '{}',
                parent_id TEXT,
                tags TEXT NOT NULL DEFAULT '[]'
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_session_ts ON events(session_id, ts)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_parent ON events(parent_id)")
            .execute(pool)
            .await?;

        // Task state with optimistic versioning
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_states (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                goal TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                constraints TEXT NOT NULL DEFAULT '[]',
                plan TEXT NOT NULL DEFAULT '[]',
                done TEXT NOT NULL DEFAULT '[]',
                blocked TEXT NOT NULL DEFAULT '[]',
                next_action TEXT,
                version INTEGER NOT NULL DEFAULT 1,
                is_current INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_task_states_session ON task_states(session_id)")
            .execute(pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_snapshots (
                task_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (task_id, version)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processed_actions (
                action_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                processed_at TEXT NOT NULL,
                PRIMARY KEY (action_id, task_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        // User profile items
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS profiles (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                confidence REAL NOT NULL DEFAULT 0.5,
                explicit INTEGER NOT NULL DEFAULT 0,
                source_event_id TEXT,
                expires_at TEXT,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        // Session summaries
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS summaries (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                short TEXT NOT NULL,
                bullets TEXT NOT NULL DEFAULT '[]',
                decisions TEXT NOT NULL DEFAULT '[]',
                todos TEXT NOT NULL DEFAULT '[]',
                covered_event_ids TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_summaries_session ON summaries(session_id, created_at)",
        )
        .execute(pool)
        .await?;

        // Semantic chunks + FTS5 mirror + vector mirror
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS semantic_chunks (
                id TEXT PRIMARY KEY,
                text TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                session_id TEXT,
                source_event_id TEXT,
                source_type TEXT,
                embedding BLOB,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE IF NOT EXISTS semantic_chunks_fts USING fts5(
                text,
                content='semantic_chunks',
                content_rowid='rowid'
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS semantic_chunks_vec (
                chunk_id TEXT PRIMARY KEY,
                embedding BLOB NOT NULL,
                dim INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        // Synchronizing triggers: the FTS and vector row sets always
        // equal the base-table row set.
        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS semantic_chunks_ai AFTER INSERT ON semantic_chunks BEGIN
                INSERT INTO semantic_chunks_fts(rowid, text) VALUES (new.rowid, new.text);
                INSERT INTO semantic_chunks_vec(chunk_id, embedding, dim)
                    SELECT new.id, new.embedding, length(new.embedding) / 4
                    WHERE new.embedding IS NOT NULL;
            END
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS semantic_chunks_ad AFTER DELETE ON semantic_chunks BEGIN
                INSERT INTO semantic_chunks_fts(semantic_chunks_fts, rowid, text)
                    VALUES ('delete', old.rowid, old.text);
                DELETE FROM semantic_chunks_vec WHERE chunk_id = old.id;
            END
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS semantic_chunks_au AFTER UPDATE ON semantic_chunks BEGIN
                INSERT INTO semantic_chunks_fts(semantic_chunks_fts, rowid, text)
                    VALUES ('delete', old.rowid, old.text);
                INSERT INTO semantic_chunks_fts(rowid, text) VALUES (new.rowid, new.text);
                DELETE FROM semantic_chunks_vec WHERE chunk_id = old.id;
                INSERT INTO semantic_chunks_vec(chunk_id, embedding, dim)
                    SELECT new.id, new.embedding, length(new.embedding) / 4
                    WHERE new.embedding IS NOT NULL;
            END
            "#,
        )
        .execute(pool)
        .await?;

        info!("Memory database migrations complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_blob_round_trip() {
        let embedding = vec![0.5_f32, -1.25, 3.0];
        let blob = embedding_to_blob(&embedding);
        assert_eq!(blob.len(), 12);
        assert_eq!(blob_to_embedding(&blob), embedding);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = init_pool_in_memory().await.unwrap();
        // Second run must not fail
        migrations::run(&pool).await.unwrap();

        let count: (i64,) =
            sqlx::query_as("SELECT count(*) FROM sqlite_master WHERE type = 'trigger'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(count.0, 3);
    }
}
