//! User profile storage
//!
//! Long-lived facts about the user, keyed by name. Items carry a
//! confidence score and an `explicit` flag (stated by the user vs
//! inferred); expired items are treated as absent and purged on first
//! observation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use super::db::MemoryPool;
use crate::error::{Error, Result};

/// A single profile fact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileItem {
    pub key: String,
    pub value: serde_json::Value,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Stated explicitly by the user (vs inferred)
    pub explicit: bool,
    /// Event that produced this fact, if known
    pub source_event_id: Option<Uuid>,
    /// Expiry instant, `None` = permanent
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Options for [`ProfileStore::set`]
#[derive(Debug, Clone, Default)]
pub struct ProfileSetOptions {
    pub confidence: Option<f64>,
    pub explicit: bool,
    pub source_event_id: Option<Uuid>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Profile store backed by SQLite
#[derive(Clone)]
pub struct ProfileStore {
    pool: MemoryPool,
}

impl ProfileStore {
    pub fn new(pool: MemoryPool) -> Self {
        ProfileStore { pool }
    }

    /// Upsert a profile item
    pub async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        opts: ProfileSetOptions,
    ) -> Result<()> {
        let confidence = opts.confidence.unwrap_or(0.5).clamp(0.0, 1.0);

        sqlx::query(
            r#"
            INSERT INTO profiles (key, value, confidence, explicit, source_event_id, expires_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (key) DO UPDATE SET
                value = excluded.value,
                confidence = excluded.confidence,
                explicit = excluded.explicit,
                source_event_id = excluded.source_event_id,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(serde_json::to_string(&value)?)
        .bind(confidence)
        .bind(opts.explicit)
        .bind(opts.source_event_id.map(|id| id.to_string()))
        .bind(opts.expires_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get one item. Expired items are deleted and reported absent.
    pub async fn get(&self, key: &str) -> Result<Option<ProfileItem>> {
        let row = sqlx::query("SELECT * FROM profiles WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let item = row_to_item(&row)?;

        if is_expired(&item) {
            self.delete(key).await?;
            return Ok(None);
        }
        Ok(Some(item))
    }

    /// All live items, explicit first then by descending confidence
    pub async fn all(&self) -> Result<Vec<ProfileItem>> {
        let rows = sqlx::query(
            "SELECT * FROM profiles ORDER BY explicit DESC, confidence DESC, key ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        let mut expired_keys = Vec::new();
        for row in &rows {
            let item = row_to_item(row)?;
            if is_expired(&item) {
                expired_keys.push(item.key);
            } else {
                items.push(item);
            }
        }

        for key in expired_keys {
            self.delete(&key).await?;
        }

        Ok(items)
    }

    /// Delete an item
    pub async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM profiles WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn is_expired(item: &ProfileItem) -> bool {
    item.expires_at.map(|at| at <= Utc::now()).unwrap_or(false)
}

fn row_to_item(row: &sqlx::sqlite::SqliteRow) -> Result<ProfileItem> {
    let value: String = row.get("value");
    let source_event_id: Option<String> = row.get("source_event_id");

    Ok(ProfileItem {
        key: row.get("key"),
        value: serde_json::from_str(&value)?,
        confidence: row.get("confidence"),
        explicit: row.get::<i64, _>("explicit") != 0,
        source_event_id: source_event_id
            .map(|id| Uuid::parse_str(&id))
            .transpose()
            .map_err(|e| Error::Internal(format!("Bad source event id: {}", e)))?,
        expires_at: row.get("expires_at"),
        updated_at: row.get("updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::db::init_pool_in_memory;

    async fn store() -> ProfileStore {
        ProfileStore::new(init_pool_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn set_then_get_round_trip() {
        let store = store().await;
        store
            .set(
                "preferred_language",
                serde_json::json!("rust"),
                ProfileSetOptions {
                    explicit: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let item = store.get("preferred_language").await.unwrap().unwrap();
        assert_eq!(item.value, serde_json::json!("rust"));
        assert!(item.explicit);
    }

    #[tokio::test]
    async fn upsert_overwrites() {
        let store = store().await;
        store
            .set("tz", serde_json::json!("UTC"), ProfileSetOptions::default())
            .await
            .unwrap();
        store
            .set(
                "tz",
                serde_json::json!("Europe/Berlin"),
                ProfileSetOptions {
                    confidence: Some(0.9),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let item = store.get("tz").await.unwrap().unwrap();
        assert_eq!(item.value, serde_json::json!("Europe/Berlin"));
        assert!((item.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn expired_items_read_as_absent_and_are_purged() {
        let store = store().await;
        store
            .set(
                "stale",
                serde_json::json!(true),
                ProfileSetOptions {
                    expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(store.get("stale").await.unwrap().is_none());

        // Row is gone, not just hidden
        let count: (i64,) = sqlx::query_as("SELECT count(*) FROM profiles")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn all_orders_explicit_then_confidence() {
        let store = store().await;
        store
            .set(
                "inferred_high",
                serde_json::json!(1),
                ProfileSetOptions {
                    confidence: Some(0.95),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .set(
                "explicit_low",
                serde_json::json!(2),
                ProfileSetOptions {
                    confidence: Some(0.2),
                    explicit: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let items = store.all().await.unwrap();
        assert_eq!(items[0].key, "explicit_low");
        assert_eq!(items[1].key, "inferred_high");
    }
}
