//! Session summarization
//!
//! The rule-based summarizer distills a window of events into a short
//! line, bullets, decisions, and a todo list, carrying incomplete
//! todos forward from the previous summary and marking them completed
//! when later activity covers their keywords. An optional LLM hook can
//! replace the short line; rule extraction always runs so a hook
//! failure never loses the summary.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::sync::{Arc, OnceLock};
use tracing::warn;
use uuid::Uuid;

use super::db::MemoryPool;
use super::events::{EventType, MemoryEvent};
use crate::error::{Error, Result};

/// A todo extracted from user messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TodoItem {
    pub text: String,
    pub completed: bool,
}

/// A persisted session summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub id: Uuid,
    pub session_id: String,
    /// One-line overview with counts
    pub short: String,
    pub bullets: Vec<String>,
    pub decisions: Vec<String>,
    pub todos: Vec<TodoItem>,
    /// Events this summary covers
    pub covered_event_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Extraction limits
#[derive(Debug, Clone)]
pub struct SummarizerLimits {
    pub max_bullets: usize,
    pub max_decisions: usize,
    pub max_todos: usize,
}

impl Default for SummarizerLimits {
    fn default() -> Self {
        SummarizerLimits {
            max_bullets: 10,
            max_decisions: 5,
            max_todos: 10,
        }
    }
}

/// Optional LLM refinement hook for the short line
#[async_trait::async_trait]
pub trait SummaryHook: Send + Sync {
    /// Produce a better one-line summary from the raw transcript
    async fn short_line(&self, transcript: &str) -> Result<String>;
}

/// Rule-based summarizer with an optional LLM hook
#[derive(Clone, Default)]
pub struct Summarizer {
    limits: SummarizerLimits,
    hook: Option<Arc<dyn SummaryHook>>,
}

fn significant_tool_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(read|write|create|delete|modify|search|find|query|api|fetch|request|execute|run|shell)",
        )
        .expect("static regex")
    })
}

fn conclusion_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(in summary|in conclusion|to summarize|the answer is|i(?:'ve| have) (?:completed|finished)|done\.)")
            .expect("static regex")
    })
}

fn todo_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:please\s+(.+?)(?:[.!?]|$)|todo:\s*(.+?)(?:[.!?]|$)|remember to\s+(.+?)(?:[.!?]|$))")
            .expect("static regex")
    })
}

const BARE_CONFIRMATIONS: &[&str] = &["ok", "okay", "yes", "no", "sure", "thanks", "thank you", "yep"];

impl Summarizer {
    pub fn new(limits: SummarizerLimits) -> Self {
        Summarizer { limits, hook: None }
    }

    pub fn with_hook(mut self, hook: Arc<dyn SummaryHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Summarize a window of events.
    ///
    /// `events` may be in any order (the store returns newest-first);
    /// they are processed chronologically. `previous` supplies todos to
    /// carry forward.
    pub async fn summarize(
        &self,
        session_id: &str,
        events: &[MemoryEvent],
        previous: Option<&Summary>,
    ) -> Summary {
        let mut ordered: Vec<&MemoryEvent> = events.iter().collect();
        ordered.sort_by_key(|e| e.ts);

        let mut bullets = Vec::new();
        let mut decisions = Vec::new();
        let mut todos: Vec<TodoItem> = previous
            .map(|p| p.todos.iter().filter(|t| !t.completed).cloned().collect())
            .unwrap_or_default();

        let mut message_count = 0usize;
        let mut tool_call_count = 0usize;

        for event in &ordered {
            let text = event_text(event);
            match event.event_type {
                EventType::UserMsg => {
                    message_count += 1;
                    if is_significant_user_message(&text) {
                        bullets.push(format!("User: {}", truncate(&text, 120)));
                    }
                    for todo in extract_todos(&text) {
                        if !todos.iter().any(|t| t.text == todo) {
                            todos.push(TodoItem {
                                text: todo,
                                completed: false,
                            });
                        }
                    }
                }
                EventType::AssistantMsg => {
                    message_count += 1;
                    if conclusion_re().is_match(&text) {
                        bullets.push(format!("Assistant: {}", truncate(&text, 120)));
                    }
                    mark_completed(&mut todos, &text);
                }
                EventType::ToolCall => {
                    tool_call_count += 1;
                    let tool = event
                        .payload
                        .get("tool")
                        .and_then(|v| v.as_str())
                        .unwrap_or("");
                    if significant_tool_re().is_match(tool) {
                        bullets.push(format!("Tool call: {}", tool));
                    }
                }
                EventType::ToolResult => {
                    mark_completed(&mut todos, &text);
                }
                EventType::Decision => {
                    decisions.push(truncate(&text, 160));
                    bullets.push(format!("Decision: {}", truncate(&text, 120)));
                }
                EventType::StateChange => {
                    bullets.push(format!("State: {}", truncate(&text, 120)));
                }
            }
        }

        bullets.truncate(self.limits.max_bullets);
        decisions.truncate(self.limits.max_decisions);
        todos.truncate(self.limits.max_todos);

        let pending = todos.iter().filter(|t| !t.completed).count();
        let mut short = format!(
            "{} messages, {} tool calls, {} decisions, {} pending todos",
            message_count,
            tool_call_count,
            decisions.len(),
            pending
        );

        if let Some(ref hook) = self.hook {
            let transcript: String = ordered
                .iter()
                .map(|e| format!("{}: {}\n", e.event_type, event_text(e)))
                .collect();
            match hook.short_line(&transcript).await {
                Ok(line) if !line.trim().is_empty() => short = line.trim().to_string(),
                Ok(_) => {}
                Err(e) => warn!("Summary hook failed, keeping rule-based line: {}", e),
            }
        }

        Summary {
            id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            short,
            bullets,
            decisions,
            todos,
            covered_event_ids: ordered.iter().map(|e| e.id).collect(),
            created_at: Utc::now(),
        }
    }
}

/// Best-effort text of an event: payload content, then summary
fn event_text(event: &MemoryEvent) -> String {
    event
        .payload
        .get("content")
        .or_else(|| event.payload.get("result"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| event.summary.clone())
        .unwrap_or_default()
}

fn is_significant_user_message(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.len() >= 20
        && !BARE_CONFIRMATIONS.contains(&trimmed.to_lowercase().trim_end_matches('.'))
}

fn extract_todos(text: &str) -> Vec<String> {
    todo_re()
        .captures_iter(text)
        .filter_map(|caps| {
            caps.get(1)
                .or_else(|| caps.get(2))
                .or_else(|| caps.get(3))
                .map(|m| m.as_str().trim().to_string())
        })
        .filter(|t| !t.is_empty())
        .collect()
}

/// Words longer than three characters, lowercased
fn keywords(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 3)
        .map(str::to_lowercase)
        .collect()
}

/// Mark incomplete todos completed when later output covers any of
/// their keywords.
fn mark_completed(todos: &mut [TodoItem], later_text: &str) {
    if later_text.is_empty() {
        return;
    }
    let lower = later_text.to_lowercase();
    for todo in todos.iter_mut().filter(|t| !t.completed) {
        if keywords(&todo.text).iter().any(|k| lower.contains(k)) {
            todo.completed = true;
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    }
}

/// Summary persistence; the latest summary per session is authoritative
#[derive(Clone)]
pub struct SummaryStore {
    pool: MemoryPool,
}

impl SummaryStore {
    pub fn new(pool: MemoryPool) -> Self {
        SummaryStore { pool }
    }

    pub async fn append(&self, summary: &Summary) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO summaries (id, session_id, short, bullets, decisions, todos, covered_event_ids, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(summary.id.to_string())
        .bind(&summary.session_id)
        .bind(&summary.short)
        .bind(serde_json::to_string(&summary.bullets)?)
        .bind(serde_json::to_string(&summary.decisions)?)
        .bind(serde_json::to_string(&summary.todos)?)
        .bind(serde_json::to_string(
            &summary
                .covered_event_ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>(),
        )?)
        .bind(summary.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn latest(&self, session_id: &str) -> Result<Option<Summary>> {
        let row = sqlx::query(
            "SELECT * FROM summaries WHERE session_id = ? ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| row_to_summary(&r)).transpose()
    }
}

fn row_to_summary(row: &sqlx::sqlite::SqliteRow) -> Result<Summary> {
    let id: String = row.get("id");
    let bullets: String = row.get("bullets");
    let decisions: String = row.get("decisions");
    let todos: String = row.get("todos");
    let covered: String = row.get("covered_event_ids");
    let covered_ids: Vec<String> = serde_json::from_str(&covered)?;

    Ok(Summary {
        id: Uuid::parse_str(&id).map_err(|e| Error::Internal(format!("Bad summary id: {}", e)))?,
        session_id: row.get("session_id"),
        short: row.get("short"),
        bullets: serde_json::from_str(&bullets)?,
        decisions: serde_json::from_str(&decisions)?,
        todos: serde_json::from_str(&todos)?,
        covered_event_ids: covered_ids
            .iter()
            .map(|s| Uuid::parse_str(s))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Internal(format!("Bad covered event id: {}", e)))?,
        created_at: row.get("created_at"),
    })
}
