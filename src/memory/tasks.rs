//! Task state storage with optimistic concurrency
//!
//! Task updates carry the version they were computed against; a stale
//! write fails with a conflict instead of clobbering newer state.
//! Every update first snapshots the previous state (FIFO-capped) so a
//! bad update can be rolled back, and updates tagged with an action ID
//! are idempotent under replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use super::db::MemoryPool;
use crate::error::{Error, Result};

/// Number of snapshots retained per task (oldest evicted first)
pub const MAX_SNAPSHOTS_PER_TASK: i64 = 10;

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Blocked => "blocked",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "in_progress" => TaskStatus::InProgress,
            "completed" => TaskStatus::Completed,
            "cancelled" => TaskStatus::Cancelled,
            "blocked" => TaskStatus::Blocked,
            _ => TaskStatus::Pending,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a single plan step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

/// One step in a task plan
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStep {
    /// Step ID, unique within the plan
    pub id: String,
    /// What this step does
    pub description: String,
    /// Current status
    pub status: StepStatus,
    /// Result text for completed steps
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Error text for failed steps
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskStep {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        TaskStep {
            id: id.into(),
            description: description.into(),
            status: StepStatus::Pending,
            result: None,
            error: None,
        }
    }
}

/// Persistent task state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub id: Uuid,
    pub session_id: String,
    pub goal: String,
    pub status: TaskStatus,
    pub constraints: Vec<String>,
    pub plan: Vec<TaskStep>,
    pub done: Vec<String>,
    pub blocked: Vec<String>,
    pub next_action: Option<String>,
    /// Monotonic version, starts at 1
    pub version: i64,
    pub is_current: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskState {
    /// Create a new task for a session
    pub fn new(session_id: impl Into<String>, goal: impl Into<String>) -> Self {
        let now = Utc::now();
        TaskState {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            goal: goal.into(),
            status: TaskStatus::Pending,
            constraints: Vec::new(),
            plan: Vec::new(),
            done: Vec::new(),
            blocked: Vec::new(),
            next_action: None,
            version: 1,
            is_current: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update applied to a task state
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub goal: Option<String>,
    pub status: Option<TaskStatus>,
    pub constraints: Option<Vec<String>>,
    pub plan: Option<Vec<TaskStep>>,
    pub done: Option<Vec<String>>,
    pub blocked: Option<Vec<String>>,
    pub next_action: Option<Option<String>>,
}

/// Task store backed by SQLite
#[derive(Clone)]
pub struct TaskStore {
    pool: MemoryPool,
}

impl TaskStore {
    pub fn new(pool: MemoryPool) -> Self {
        TaskStore { pool }
    }

    /// Create a task. If it is current, any previously current task in
    /// the same session loses the flag.
    pub async fn create(&self, task: &TaskState) -> Result<()> {
        if task.plan.len()
            != task
                .plan
                .iter()
                .map(|s| s.id.as_str())
                .collect::<std::collections::HashSet<_>>()
                .len()
        {
            return Err(Error::InvalidInput("Plan step ids must be unique".into()));
        }

        if task.is_current {
            sqlx::query("UPDATE task_states SET is_current = 0 WHERE session_id = ?")
                .bind(&task.session_id)
                .execute(&self.pool)
                .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO task_states
                (id, session_id, goal, status, constraints, plan, done, blocked,
                 next_action, version, is_current, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task.id.to_string())
        .bind(&task.session_id)
        .bind(&task.goal)
        .bind(task.status.as_str())
        .bind(serde_json::to_string(&task.constraints)?)
        .bind(serde_json::to_string(&task.plan)?)
        .bind(serde_json::to_string(&task.done)?)
        .bind(serde_json::to_string(&task.blocked)?)
        .bind(&task.next_action)
        .bind(task.version)
        .bind(task.is_current)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a task by ID
    pub async fn get(&self, id: Uuid) -> Result<Option<TaskState>> {
        let row = sqlx::query("SELECT * FROM task_states WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_task(&r)).transpose()
    }

    /// The current task, preferring the given session
    pub async fn get_current(&self, session_id: Option<&str>) -> Result<Option<TaskState>> {
        if let Some(session_id) = session_id {
            let row = sqlx::query(
                "SELECT * FROM task_states WHERE is_current = 1 AND session_id = ? LIMIT 1",
            )
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(r) = row {
                return Ok(Some(row_to_task(&r)?));
            }
        }

        let row = sqlx::query(
            "SELECT * FROM task_states WHERE is_current = 1 ORDER BY updated_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_task(&r)).transpose()
    }

    /// Apply a patch with optimistic concurrency.
    ///
    /// If `action_id` was already processed for this task the stored
    /// state is returned unchanged (idempotent replay). A version
    /// mismatch raises [`Error::TaskStateConflict`].
    pub async fn update(
        &self,
        id: Uuid,
        patch: TaskPatch,
        action_id: Option<&str>,
    ) -> Result<TaskState> {
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {}", id)))?;
        self.apply_update(&current, patch, action_id).await
    }

    /// Apply a patch against an already-loaded state. The write is
    /// conditioned on `current.version`; callers holding a stale state
    /// get a conflict.
    pub async fn apply_update(
        &self,
        current: &TaskState,
        patch: TaskPatch,
        action_id: Option<&str>,
    ) -> Result<TaskState> {
        let id = current.id;

        if let Some(action_id) = action_id {
            let seen: Option<(String,)> = sqlx::query_as(
                "SELECT action_id FROM processed_actions WHERE action_id = ? AND task_id = ?",
            )
            .bind(action_id)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
            if seen.is_some() {
                // Idempotent replay: return what is stored now
                return self
                    .get(id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("task {}", id)));
            }
        }

        self.snapshot_state(current).await?;

        let mut next = current.clone();
        if let Some(goal) = patch.goal {
            next.goal = goal;
        }
        if let Some(status) = patch.status {
            next.status = status;
        }
        if let Some(constraints) = patch.constraints {
            next.constraints = constraints;
        }
        if let Some(plan) = patch.plan {
            let unique = plan
                .iter()
                .map(|s| s.id.as_str())
                .collect::<std::collections::HashSet<_>>()
                .len();
            if unique != plan.len() {
                return Err(Error::InvalidInput("Plan step ids must be unique".into()));
            }
            next.plan = plan;
        }
        if let Some(done) = patch.done {
            next.done = done;
        }
        if let Some(blocked) = patch.blocked {
            next.blocked = blocked;
        }
        if let Some(next_action) = patch.next_action {
            next.next_action = next_action;
        }
        next.version = current.version + 1;
        next.updated_at = Utc::now();

        let affected = sqlx::query(
            r#"
            UPDATE task_states
            SET goal = ?, status = ?, constraints = ?, plan = ?, done = ?,
                blocked = ?, next_action = ?, version = ?, updated_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(&next.goal)
        .bind(next.status.as_str())
        .bind(serde_json::to_string(&next.constraints)?)
        .bind(serde_json::to_string(&next.plan)?)
        .bind(serde_json::to_string(&next.done)?)
        .bind(serde_json::to_string(&next.blocked)?)
        .bind(&next.next_action)
        .bind(next.version)
        .bind(next.updated_at)
        .bind(id.to_string())
        .bind(current.version)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            let actual: Option<(i64,)> =
                sqlx::query_as("SELECT version FROM task_states WHERE id = ?")
                    .bind(id.to_string())
                    .fetch_optional(&self.pool)
                    .await?;
            return Err(Error::TaskStateConflict {
                expected: current.version,
                actual: actual.map(|(v,)| v).unwrap_or(0),
            });
        }

        if let Some(action_id) = action_id {
            sqlx::query(
                "INSERT OR IGNORE INTO processed_actions (action_id, task_id, processed_at) VALUES (?, ?, ?)",
            )
            .bind(action_id)
            .bind(id.to_string())
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        }

        Ok(next)
    }

    /// Restore a snapshotted version as a new version (version never
    /// decrements).
    pub async fn rollback(&self, id: Uuid, version: i64) -> Result<TaskState> {
        let snapshot: Option<(String,)> =
            sqlx::query_as("SELECT state FROM task_snapshots WHERE task_id = ? AND version = ?")
                .bind(id.to_string())
                .bind(version)
                .fetch_optional(&self.pool)
                .await?;

        let (state_json,) = snapshot
            .ok_or_else(|| Error::NotFound(format!("snapshot {} of task {}", version, id)))?;
        let restored: TaskState = serde_json::from_str(&state_json)?;

        self.update(
            id,
            TaskPatch {
                goal: Some(restored.goal),
                status: Some(restored.status),
                constraints: Some(restored.constraints),
                plan: Some(restored.plan),
                done: Some(restored.done),
                blocked: Some(restored.blocked),
                next_action: Some(restored.next_action),
            },
            None,
        )
        .await
    }

    /// Versions available for rollback, oldest first
    pub async fn snapshots(&self, id: Uuid) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT version FROM task_snapshots WHERE task_id = ? ORDER BY version ASC",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(v,)| v).collect())
    }

    async fn snapshot_state(&self, state: &TaskState) -> Result<()> {
        // INSERT OR IGNORE: a racing update may snapshot the same
        // version; only one copy is kept.
        sqlx::query(
            "INSERT OR IGNORE INTO task_snapshots (task_id, version, state, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(state.id.to_string())
        .bind(state.version)
        .bind(serde_json::to_string(state)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM task_snapshots
            WHERE task_id = ? AND version NOT IN (
                SELECT version FROM task_snapshots
                WHERE task_id = ?
                ORDER BY version DESC
                LIMIT ?
            )
            "#,
        )
        .bind(state.id.to_string())
        .bind(state.id.to_string())
        .bind(MAX_SNAPSHOTS_PER_TASK)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Result<TaskState> {
    let id: String = row.get("id");
    let status: String = row.get("status");
    let constraints: String = row.get("constraints");
    let plan: String = row.get("plan");
    let done: String = row.get("done");
    let blocked: String = row.get("blocked");

    Ok(TaskState {
        id: Uuid::parse_str(&id).map_err(|e| Error::Internal(format!("Bad task id: {}", e)))?,
        session_id: row.get("session_id"),
        goal: row.get("goal"),
        status: TaskStatus::from_str(&status),
        constraints: serde_json::from_str(&constraints)?,
        plan: serde_json::from_str(&plan)?,
        done: serde_json::from_str(&done)?,
        blocked: serde_json::from_str(&blocked)?,
        next_action: row.get("next_action"),
        version: row.get("version"),
        is_current: row.get::<i64, _>("is_current") != 0,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::db::init_pool_in_memory;

    async fn store() -> TaskStore {
        TaskStore::new(init_pool_in_memory().await.unwrap())
    }

    fn status_patch(status: TaskStatus) -> TaskPatch {
        TaskPatch {
            status: Some(status),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_and_get_current() {
        let store = store().await;
        let task = TaskState::new("s1", "ship the release");
        store.create(&task).await.unwrap();

        let current = store.get_current(Some("s1")).await.unwrap().unwrap();
        assert_eq!(current.id, task.id);
        assert_eq!(current.version, 1);

        // A second current task displaces the first
        let task2 = TaskState::new("s1", "write the changelog");
        store.create(&task2).await.unwrap();
        let current = store.get_current(Some("s1")).await.unwrap().unwrap();
        assert_eq!(current.id, task2.id);

        let old = store.get(task.id).await.unwrap().unwrap();
        assert!(!old.is_current);
    }

    #[tokio::test]
    async fn update_bumps_version() {
        let store = store().await;
        let task = TaskState::new("s1", "goal");
        store.create(&task).await.unwrap();

        let updated = store
            .update(task.id, status_patch(TaskStatus::InProgress), None)
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let store = store().await;
        let task = TaskState::new("s1", "goal");
        store.create(&task).await.unwrap();

        // Both sides of the race load v1
        let loaded = store.get(task.id).await.unwrap().unwrap();

        // Winner commits v2
        store
            .apply_update(&loaded, status_patch(TaskStatus::InProgress), None)
            .await
            .unwrap();

        // Loser still holds v1 and must conflict, naming both versions
        let err = store
            .apply_update(&loaded, status_patch(TaskStatus::Cancelled), None)
            .await
            .unwrap_err();
        match err {
            Error::TaskStateConflict { expected, actual } => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("expected TaskStateConflict, got {}", other),
        }

        // The winner's write is intact
        let stored = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::InProgress);
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn action_id_makes_update_idempotent() {
        let store = store().await;
        let task = TaskState::new("s1", "goal");
        store.create(&task).await.unwrap();

        let first = store
            .update(task.id, status_patch(TaskStatus::InProgress), Some("a1"))
            .await
            .unwrap();
        assert_eq!(first.version, 2);

        // Replay with the same action id: no version bump, same state
        let replay = store
            .update(task.id, status_patch(TaskStatus::Completed), Some("a1"))
            .await
            .unwrap();
        assert_eq!(replay.version, 2);
        assert_eq!(replay.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn snapshots_are_fifo_capped() {
        let store = store().await;
        let task = TaskState::new("s1", "goal");
        store.create(&task).await.unwrap();

        for i in 0..15 {
            store
                .update(
                    task.id,
                    TaskPatch {
                        next_action: Some(Some(format!("step {}", i))),
                        ..Default::default()
                    },
                    None,
                )
                .await
                .unwrap();
        }

        let versions = store.snapshots(task.id).await.unwrap();
        assert_eq!(versions.len(), 10);
        // 15 updates snapshot versions 1..=15; the oldest surviving is 6
        assert_eq!(*versions.first().unwrap(), 6);
        assert_eq!(*versions.last().unwrap(), 15);
    }

    #[tokio::test]
    async fn rollback_restores_plan_as_new_version() {
        let store = store().await;
        let mut task = TaskState::new("s1", "goal");
        task.plan = vec![TaskStep::new("step-1", "first")];
        store.create(&task).await.unwrap();

        store
            .update(
                task.id,
                TaskPatch {
                    plan: Some(vec![
                        TaskStep::new("step-1", "first"),
                        TaskStep::new("step-2", "second"),
                    ]),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();

        let rolled = store.rollback(task.id, 1).await.unwrap();
        assert_eq!(rolled.version, 3); // never decrements
        assert_eq!(rolled.plan.len(), 1);
        assert_eq!(rolled.plan[0].id, "step-1");

        let fetched = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.plan, rolled.plan);
    }

    #[tokio::test]
    async fn duplicate_step_ids_rejected() {
        let store = store().await;
        let mut task = TaskState::new("s1", "goal");
        task.plan = vec![TaskStep::new("dup", "a"), TaskStep::new("dup", "b")];
        assert!(store.create(&task).await.is_err());
    }
}
