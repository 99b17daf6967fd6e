//! Append-only memory event log
//!
//! Every observable step of a session (user messages, assistant
//! replies, tool calls and their results, decisions, state changes)
//! is recorded as an immutable event. Tool results link back to their
//! originating call through `parent_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use super::db::MemoryPool;
use crate::error::{Error, Result};

/// Kind of a memory event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    UserMsg,
    AssistantMsg,
    ToolCall,
    ToolResult,
    Decision,
    StateChange,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::UserMsg => "USER_MSG",
            EventType::AssistantMsg => "ASSISTANT_MSG",
            EventType::ToolCall => "TOOL_CALL",
            EventType::ToolResult => "TOOL_RESULT",
            EventType::Decision => "DECISION",
            EventType::StateChange => "STATE_CHANGE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "USER_MSG" => Some(EventType::UserMsg),
            "ASSISTANT_MSG" => Some(EventType::AssistantMsg),
            "TOOL_CALL" => Some(EventType::ToolCall),
            "TOOL_RESULT" => Some(EventType::ToolResult),
            "DECISION" => Some(EventType::Decision),
            "STATE_CHANGE" => Some(EventType::StateChange),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An extracted entity attached to an event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEntity {
    /// Entity type, e.g. "file", "person", "url"
    #[serde(rename = "type")]
    pub entity_type: String,
    /// Entity value
    pub value: String,
}

/// An immutable memory event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEvent {
    /// Unique event ID
    pub id: Uuid,
    /// Event kind
    pub event_type: EventType,
    /// Session this event belongs to
    pub session_id: String,
    /// When the event occurred
    pub ts: DateTime<Utc>,
    /// Detected intent, if any
    pub intent: Option<String>,
    /// Extracted entities
    pub entities: Vec<EventEntity>,
    /// Short human-readable summary
    pub summary: Option<String>,
    /// Opaque payload
    pub payload: serde_json::Value,
    /// Parent event (TOOL_RESULT -> TOOL_CALL)
    pub parent_id: Option<Uuid>,
    /// Free-form tags
    pub tags: Vec<String>,
}

impl MemoryEvent {
    /// Create a new event for a session
    pub fn new(event_type: EventType, session_id: impl Into<String>) -> Self {
        MemoryEvent {
            id: Uuid::new_v4(),
            event_type,
            session_id: session_id.into(),
            ts: Utc::now(),
            intent: None,
            entities: Vec::new(),
            summary: None,
            payload: serde_json::json!({}),
            parent_id: None,
            tags: Vec::new(),
        }
    }

    /// Set the summary
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Set the payload
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set the parent event ID
    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Add a tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Filters for querying the event log
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Restrict to one session
    pub session_id: Option<String>,
    /// Events at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Events at or before this instant
    pub until: Option<DateTime<Utc>>,
    /// Restrict to these event types
    pub types: Vec<EventType>,
    /// Maximum number of events (newest first)
    pub limit: Option<u32>,
}

/// Append-only event store backed by SQLite
#[derive(Clone)]
pub struct EventStore {
    pool: MemoryPool,
}

impl EventStore {
    pub fn new(pool: MemoryPool) -> Self {
        EventStore { pool }
    }

    /// Append an event. Events are never mutated after this point.
    ///
    /// A TOOL_RESULT carrying a parent ID must reference an existing
    /// TOOL_CALL in the same session.
    pub async fn append(&self, event: &MemoryEvent) -> Result<()> {
        if event.event_type == EventType::ToolResult {
            if let Some(parent_id) = event.parent_id {
                let parent: Option<(String,)> = sqlx::query_as(
                    "SELECT event_type FROM events WHERE id = ? AND session_id = ?",
                )
                .bind(parent_id.to_string())
                .bind(&event.session_id)
                .fetch_optional(&self.pool)
                .await?;

                match parent {
                    Some((t,)) if t == EventType::ToolCall.as_str() => {}
                    Some(_) => {
                        return Err(Error::InvalidInput(format!(
                            "TOOL_RESULT parent {} is not a TOOL_CALL",
                            parent_id
                        )))
                    }
                    None => {
                        return Err(Error::InvalidInput(format!(
                            "TOOL_RESULT parent {} does not exist in session {}",
                            parent_id, event.session_id
                        )))
                    }
                }
            }
        }

        sqlx::query(
            r#"
            INSERT INTO events (id, event_type, session_id, ts, intent, entities, summary, payload, parent_id, tags)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.id.to_string())
        .bind(event.event_type.as_str())
        .bind(&event.session_id)
        .bind(event.ts)
        .bind(&event.intent)
        .bind(serde_json::to_string(&event.entities)?)
        .bind(&event.summary)
        .bind(serde_json::to_string(&event.payload)?)
        .bind(event.parent_id.map(|id| id.to_string()))
        .bind(serde_json::to_string(&event.tags)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a single event by ID
    pub async fn get(&self, id: Uuid) -> Result<Option<MemoryEvent>> {
        let row = sqlx::query("SELECT * FROM events WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| row_to_event(&r)).transpose()
    }

    /// Query events, newest first
    pub async fn query(&self, q: &EventQuery) -> Result<Vec<MemoryEvent>> {
        let mut sql = String::from("SELECT * FROM events WHERE 1 = 1");
        if q.session_id.is_some() {
            sql.push_str(" AND session_id = ?");
        }
        if q.since.is_some() {
            sql.push_str(" AND ts >= ?");
        }
        if q.until.is_some() {
            sql.push_str(" AND ts <= ?");
        }
        if !q.types.is_empty() {
            sql.push_str(" AND event_type IN (");
            sql.push_str(&vec!["?"; q.types.len()].join(", "));
            sql.push(')');
        }
        // rowid breaks ties between events sharing a timestamp, so
        // insertion order is preserved
        sql.push_str(" ORDER BY ts DESC, rowid DESC");
        if q.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(ref session_id) = q.session_id {
            query = query.bind(session_id);
        }
        if let Some(since) = q.since {
            query = query.bind(since);
        }
        if let Some(until) = q.until {
            query = query.bind(until);
        }
        for t in &q.types {
            query = query.bind(t.as_str());
        }
        if let Some(limit) = q.limit {
            query = query.bind(limit as i64);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_event).collect()
    }

    /// Children of an event (e.g. results of a tool call)
    pub async fn children(&self, parent_id: Uuid) -> Result<Vec<MemoryEvent>> {
        let rows = sqlx::query("SELECT * FROM events WHERE parent_id = ? ORDER BY ts ASC, rowid ASC")
            .bind(parent_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_event).collect()
    }
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<MemoryEvent> {
    let id: String = row.get("id");
    let event_type: String = row.get("event_type");
    let entities: String = row.get("entities");
    let payload: String = row.get("payload");
    let parent_id: Option<String> = row.get("parent_id");
    let tags: String = row.get("tags");

    Ok(MemoryEvent {
        id: Uuid::parse_str(&id).map_err(|e| Error::Internal(format!("Bad event id: {}", e)))?,
        event_type: EventType::from_str(&event_type)
            .ok_or_else(|| Error::Internal(format!("Unknown event type: {}", event_type)))?,
        session_id: row.get("session_id"),
        ts: row.get("ts"),
        intent: row.get("intent"),
        entities: serde_json::from_str(&entities)?,
        summary: row.get("summary"),
        payload: serde_json::from_str(&payload)?,
        parent_id: parent_id
            .map(|p| Uuid::parse_str(&p))
            .transpose()
            .map_err(|e| Error::Internal(format!("Bad parent id: {}", e)))?,
        tags: serde_json::from_str(&tags)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::db::init_pool_in_memory;

    async fn store() -> EventStore {
        EventStore::new(init_pool_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn append_and_query_newest_first() {
        let store = store().await;

        for i in 0..3 {
            let mut event = MemoryEvent::new(EventType::UserMsg, "s1")
                .with_summary(format!("message {}", i));
            event.ts = Utc::now() + chrono::Duration::milliseconds(i);
            store.append(&event).await.unwrap();
        }

        let events = store
            .query(&EventQuery {
                session_id: Some("s1".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].summary.as_deref(), Some("message 2"));
        assert_eq!(events[2].summary.as_deref(), Some("message 0"));
    }

    #[tokio::test]
    async fn tool_result_requires_tool_call_parent() {
        let store = store().await;

        let call = MemoryEvent::new(EventType::ToolCall, "s1");
        store.append(&call).await.unwrap();

        let result = MemoryEvent::new(EventType::ToolResult, "s1").with_parent(call.id);
        store.append(&result).await.unwrap();

        let children = store.children(call.id).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].event_type, EventType::ToolResult);

        // Dangling parent is rejected
        let orphan = MemoryEvent::new(EventType::ToolResult, "s1").with_parent(Uuid::new_v4());
        assert!(store.append(&orphan).await.is_err());

        // Parent in a different session is rejected
        let cross = MemoryEvent::new(EventType::ToolResult, "s2").with_parent(call.id);
        assert!(store.append(&cross).await.is_err());
    }

    #[tokio::test]
    async fn query_filters_by_type_and_limit() {
        let store = store().await;

        store
            .append(&MemoryEvent::new(EventType::UserMsg, "s1"))
            .await
            .unwrap();
        store
            .append(&MemoryEvent::new(EventType::Decision, "s1"))
            .await
            .unwrap();
        store
            .append(&MemoryEvent::new(EventType::Decision, "s1"))
            .await
            .unwrap();

        let decisions = store
            .query(&EventQuery {
                session_id: Some("s1".into()),
                types: vec![EventType::Decision],
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].event_type, EventType::Decision);
    }
}
