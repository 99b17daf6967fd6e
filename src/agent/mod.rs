//! Agent: the execution loop and the policies it consults

pub mod engine;
pub mod evaluator;
pub mod metrics;
pub mod prompts;
pub mod router;
pub mod state_machine;
pub mod stop;
pub mod types;

pub use engine::{Agent, AgentBuilder, AgentConfig, ChatOptions, StreamCallbacks};
pub use evaluator::{EvalContext, Evaluation, Evaluator, HeuristicEvaluator, SelfCheck};
pub use metrics::{AgentMetrics, MetricsSnapshot, ToolStats};
pub use prompts::{compose_system_prompt, PromptTemplate, DEFAULT_SYSTEM_PROMPT};
pub use router::{
    CostOptimization, CostStats, ModelRouter, ModelTier, RouterConfig, TaskType, TierConfig,
};
pub use state_machine::{
    AgentEvent, AgentState, AgentStateMachine, CheckpointRecord, CheckpointStore,
};
pub use stop::{
    CostLimit, FnCondition, StopChecker, StopCondition, StopConfig, StopDecision, StopPattern,
    StopState, StopType,
};
pub use types::*;
