//! Agent lifecycle state machine and checkpointing
//!
//! The loop drives START/COMPLETE/ERROR, the tool pipeline drives
//! TOOL_START/TOOL_END, and external callers drive PAUSE/RESUME/
//! RESTORE. Invalid transitions are rejected rather than silently
//! absorbed. Checkpoints capture enough of the run to rewind it.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use crate::agent::metrics::MetricsSnapshot;
use crate::agent::types::Message;
use crate::error::{Error, Result};
use crate::memory::TaskStep;

/// Agent lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Running,
    Tool,
    Paused,
    Completed,
    Error,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentState::Idle => "idle",
            AgentState::Running => "running",
            AgentState::Tool => "tool",
            AgentState::Paused => "paused",
            AgentState::Completed => "completed",
            AgentState::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Events that trigger transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEvent {
    Start,
    ToolStart,
    ToolEnd,
    Pause,
    Resume,
    Complete,
    Error,
    Restore,
}

/// A saved point-in-time of a run
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    pub id: Uuid,
    pub name: String,
    pub state: AgentState,
    pub history: Vec<Message>,
    pub plan: Vec<TaskStep>,
    pub task_id: Option<Uuid>,
    pub metrics: MetricsSnapshot,
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
}

/// Thread-safe state machine
#[derive(Clone)]
pub struct AgentStateMachine {
    state: Arc<Mutex<AgentState>>,
}

impl AgentStateMachine {
    pub fn new() -> Self {
        AgentStateMachine {
            state: Arc::new(Mutex::new(AgentState::Idle)),
        }
    }

    /// Current state
    pub fn state(&self) -> AgentState {
        *self.state.lock().expect("state lock")
    }

    /// Apply an event; invalid transitions are an error
    pub fn handle(&self, event: AgentEvent) -> Result<AgentState> {
        let mut state = self.state.lock().expect("state lock");
        let next = Self::transition(*state, event)?;
        debug!("State transition: {} --{:?}--> {}", state, event, next);
        *state = next;
        Ok(next)
    }

    /// Force a state (used by RESTORE)
    pub fn restore_to(&self, target: AgentState) {
        let mut state = self.state.lock().expect("state lock");
        info!("State restored: {} -> {}", state, target);
        *state = target;
    }

    fn transition(current: AgentState, event: AgentEvent) -> Result<AgentState> {
        use AgentState as S;

        let next = match (current, event) {
            (S::Idle | S::Completed | S::Error, AgentEvent::Start) => S::Running,
            (S::Running, AgentEvent::ToolStart) => S::Tool,
            (S::Tool, AgentEvent::ToolEnd) => S::Running,
            (S::Running | S::Tool, AgentEvent::Pause) => S::Paused,
            (S::Paused, AgentEvent::Resume) => S::Running,
            (S::Running, AgentEvent::Complete) => S::Completed,
            (_, AgentEvent::Error) => S::Error,
            (_, AgentEvent::Restore) => S::Running,
            (state, event) => {
                return Err(Error::Internal(format!(
                    "Invalid state transition: {} on {:?}",
                    state, event
                )))
            }
        };
        Ok(next)
    }
}

impl Default for AgentStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// In-process checkpoint ring (newest kept, oldest evicted)
#[derive(Clone)]
pub struct CheckpointStore {
    records: Arc<Mutex<VecDeque<CheckpointRecord>>>,
    capacity: usize,
}

impl CheckpointStore {
    pub fn new(capacity: usize) -> Self {
        CheckpointStore {
            records: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    /// Save a checkpoint, returning its id
    pub fn save(&self, record: CheckpointRecord) -> Uuid {
        let id = record.id;
        let mut records = self.records.lock().expect("checkpoint lock");
        records.push_back(record);
        while records.len() > self.capacity {
            records.pop_front();
        }
        id
    }

    /// Fetch a checkpoint by id
    pub fn get(&self, id: Uuid) -> Option<CheckpointRecord> {
        self.records
            .lock()
            .expect("checkpoint lock")
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    /// The most recent checkpoint
    pub fn latest(&self) -> Option<CheckpointRecord> {
        self.records
            .lock()
            .expect("checkpoint lock")
            .back()
            .cloned()
    }

    /// List checkpoint ids and names, oldest first
    pub fn list(&self) -> Vec<(Uuid, String)> {
        self.records
            .lock()
            .expect("checkpoint lock")
            .iter()
            .map(|r| (r.id, r.name.clone()))
            .collect()
    }
}

impl Default for CheckpointStore {
    fn default() -> Self {
        Self::new(20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let machine = AgentStateMachine::new();
        assert_eq!(machine.state(), AgentState::Idle);

        machine.handle(AgentEvent::Start).unwrap();
        machine.handle(AgentEvent::ToolStart).unwrap();
        assert_eq!(machine.state(), AgentState::Tool);
        machine.handle(AgentEvent::ToolEnd).unwrap();
        machine.handle(AgentEvent::Complete).unwrap();
        assert_eq!(machine.state(), AgentState::Completed);

        // A completed machine can start a new run
        machine.handle(AgentEvent::Start).unwrap();
        assert_eq!(machine.state(), AgentState::Running);
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let machine = AgentStateMachine::new();
        assert!(machine.handle(AgentEvent::ToolStart).is_err());
        assert!(machine.handle(AgentEvent::Complete).is_err());
        assert_eq!(machine.state(), AgentState::Idle);
    }

    #[test]
    fn pause_resume_round_trip() {
        let machine = AgentStateMachine::new();
        machine.handle(AgentEvent::Start).unwrap();
        machine.handle(AgentEvent::Pause).unwrap();
        assert_eq!(machine.state(), AgentState::Paused);
        machine.handle(AgentEvent::Resume).unwrap();
        assert_eq!(machine.state(), AgentState::Running);
    }

    #[test]
    fn error_is_reachable_from_anywhere() {
        let machine = AgentStateMachine::new();
        machine.handle(AgentEvent::Error).unwrap();
        assert_eq!(machine.state(), AgentState::Error);
        machine.handle(AgentEvent::Start).unwrap();
        assert_eq!(machine.state(), AgentState::Running);
    }

    fn record(name: &str) -> CheckpointRecord {
        CheckpointRecord {
            id: Uuid::new_v4(),
            name: name.into(),
            state: AgentState::Running,
            history: vec![Message::user("hi")],
            plan: Vec::new(),
            task_id: None,
            metrics: MetricsSnapshot::default(),
            iteration: 1,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn checkpoint_store_caps_and_finds() {
        let store = CheckpointStore::new(2);
        let a = store.save(record("a"));
        let _b = store.save(record("b"));
        let c = store.save(record("c"));

        // Oldest evicted
        assert!(store.get(a).is_none());
        assert!(store.get(c).is_some());
        assert_eq!(store.list().len(), 2);
        assert_eq!(store.latest().unwrap().name, "c");
    }
}
