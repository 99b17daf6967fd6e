//! Task management tools - AI-callable surfaces over the task store
//!
//! Tasks are created when the user explicitly asks for something to be
//! tracked, not for every message. The loop injects `_session_id`
//! before execution.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::memory::{TaskPatch, TaskState, TaskStatus, TaskStep, TaskStore};
use crate::tools::traits::{Tool, ToolCategory, ToolResult};

fn session_id(args: &Value) -> String {
    args.get("_session_id")
        .and_then(|v| v.as_str())
        .unwrap_or("default")
        .to_string()
}

/// Tool to create and track a new task
pub struct TaskCreateTool {
    store: TaskStore,
}

impl TaskCreateTool {
    pub fn new(store: TaskStore) -> Self {
        TaskCreateTool { store }
    }
}

#[async_trait]
impl Tool for TaskCreateTool {
    fn name(&self) -> &str {
        "task_create"
    }

    fn description(&self) -> &str {
        "Create a task to track a goal the user wants accomplished, with an optional step plan. The new task becomes the current one."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "goal": {
                    "type": "string",
                    "description": "What should be accomplished"
                },
                "steps": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Ordered plan steps"
                },
                "constraints": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Constraints to respect"
                }
            },
            "required": ["goal"]
        })
    }

    fn category(&self) -> Option<ToolCategory> {
        Some(ToolCategory::Memory)
    }

    async fn execute(&self, args: Value) -> Result<ToolResult> {
        let goal = args
            .get("goal")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::InvalidInput("Missing 'goal' parameter".into()))?;

        let mut task = TaskState::new(session_id(&args), goal);

        if let Some(steps) = args.get("steps").and_then(|v| v.as_array()) {
            task.plan = steps
                .iter()
                .filter_map(|v| v.as_str())
                .enumerate()
                .map(|(i, desc)| TaskStep::new(format!("step-{}", i + 1), desc))
                .collect();
        }
        if let Some(constraints) = args.get("constraints").and_then(|v| v.as_array()) {
            task.constraints = constraints
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
        }

        self.store.create(&task).await?;
        info!("Created task {} ({})", task.id, task.goal);

        Ok(ToolResult::success(format!(
            "Created task {} with {} steps",
            task.id,
            task.plan.len()
        )))
    }
}

/// Tool to update the status of an existing task
pub struct TaskUpdateTool {
    store: TaskStore,
}

impl TaskUpdateTool {
    pub fn new(store: TaskStore) -> Self {
        TaskUpdateTool { store }
    }
}

#[async_trait]
impl Tool for TaskUpdateTool {
    fn name(&self) -> &str {
        "task_update"
    }

    fn description(&self) -> &str {
        "Update a task's status or next action. Pass the task id from task_create or task_current."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task_id": {
                    "type": "string",
                    "description": "The task's UUID"
                },
                "status": {
                    "type": "string",
                    "enum": ["pending", "in_progress", "completed", "cancelled", "blocked"],
                    "description": "New task status"
                },
                "next_action": {
                    "type": "string",
                    "description": "What should happen next"
                },
                "action_id": {
                    "type": "string",
                    "description": "Idempotency key for this update"
                }
            },
            "required": ["task_id"]
        })
    }

    fn category(&self) -> Option<ToolCategory> {
        Some(ToolCategory::Memory)
    }

    async fn execute(&self, args: Value) -> Result<ToolResult> {
        let task_id = args
            .get("task_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::InvalidInput("Missing 'task_id' parameter".into()))?;
        let task_id = Uuid::parse_str(task_id)
            .map_err(|e| Error::InvalidInput(format!("Invalid task id: {}", e)))?;

        let patch = TaskPatch {
            status: args
                .get("status")
                .and_then(|v| v.as_str())
                .map(TaskStatus::from_str),
            next_action: args
                .get("next_action")
                .and_then(|v| v.as_str())
                .map(|s| Some(s.to_string())),
            ..Default::default()
        };

        let action_id = args.get("action_id").and_then(|v| v.as_str());
        let updated = self.store.update(task_id, patch, action_id).await?;

        Ok(ToolResult::success(format!(
            "Task {} is now {} (v{})",
            updated.id, updated.status, updated.version
        )))
    }
}

/// Tool to fetch the current task
pub struct TaskCurrentTool {
    store: TaskStore,
}

impl TaskCurrentTool {
    pub fn new(store: TaskStore) -> Self {
        TaskCurrentTool { store }
    }
}

#[async_trait]
impl Tool for TaskCurrentTool {
    fn name(&self) -> &str {
        "task_current"
    }

    fn description(&self) -> &str {
        "Get the current task for this session, including its plan and status."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    fn category(&self) -> Option<ToolCategory> {
        Some(ToolCategory::Memory)
    }

    fn retryable(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> Result<ToolResult> {
        let session = session_id(&args);
        match self.store.get_current(Some(&session)).await? {
            Some(task) => {
                let plan: String = task
                    .plan
                    .iter()
                    .map(|s| format!("- [{:?}] {}\n", s.status, s.description))
                    .collect();
                Ok(ToolResult::success(format!(
                    "Task {} ({}): {}\n{}",
                    task.id, task.status, task.goal, plan
                )))
            }
            None => Ok(ToolResult::success("No current task.")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::db::init_pool_in_memory;

    #[tokio::test]
    async fn create_update_current_flow() {
        let pool = init_pool_in_memory().await.unwrap();
        let store = TaskStore::new(pool);
        let create = TaskCreateTool::new(store.clone());
        let update = TaskUpdateTool::new(store.clone());
        let current = TaskCurrentTool::new(store.clone());

        create
            .execute(serde_json::json!({
                "goal": "write the quarterly report",
                "steps": ["collect numbers", "draft", "review"],
                "_session_id": "s1"
            }))
            .await
            .unwrap();

        let task = store.get_current(Some("s1")).await.unwrap().unwrap();
        assert_eq!(task.plan.len(), 3);

        let result = update
            .execute(serde_json::json!({
                "task_id": task.id.to_string(),
                "status": "in_progress",
                "_session_id": "s1"
            }))
            .await
            .unwrap();
        assert!(result.content.unwrap().contains("in_progress"));

        let result = current
            .execute(serde_json::json!({ "_session_id": "s1" }))
            .await
            .unwrap();
        assert!(result.content.unwrap().contains("quarterly report"));
    }

    #[tokio::test]
    async fn update_rejects_bad_uuid() {
        let pool = init_pool_in_memory().await.unwrap();
        let update = TaskUpdateTool::new(TaskStore::new(pool));
        let err = update
            .execute(serde_json::json!({ "task_id": "not-a-uuid" }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
