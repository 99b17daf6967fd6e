//! The agent execution loop
//!
//! One `chat`/`stream` call runs up to N iterations. Each iteration:
//! stop check, optional checkpoint, model routing, LLM call through
//! the API recovery policy, compaction accounting, then either tool
//! dispatch (results appended in emission order, loop continues) or
//! output guardrail + evaluation and return. Memory events written in
//! one iteration are visible to the next.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::evaluator::{EvalContext, Evaluator};
use crate::agent::metrics::AgentMetrics;
use crate::agent::prompts::{compose_system_prompt, DEFAULT_SYSTEM_PROMPT};
use crate::agent::router::{ModelRouter, RouterConfig, TaskType};
use crate::agent::state_machine::{
    AgentEvent, AgentState, AgentStateMachine, CheckpointRecord, CheckpointStore,
};
use crate::agent::stop::{StopChecker, StopConfig, StopDecision, StopState, StopType};
use crate::agent::types::*;
use crate::error::{Error, Result};
use crate::guardrail::Guardrail;
use crate::memory::{
    inject, CompactionConfig, CompactionManager, EventQuery, EventType, MemoryEvent,
    MemoryManager, RetrievalRequest,
};
use crate::providers::LlmClient;
use crate::recovery::{RecoveryConfig, RecoveryPolicy};
use crate::tools::{
    DispatchContext, PermissionPolicy, PipelineConfig, ToolDispatchOutcome, ToolPipeline,
    ToolRegistry,
};

/// Loop-level configuration
#[derive(Clone)]
pub struct AgentConfig {
    /// Base system prompt
    pub system_prompt: String,
    /// Session identifier for memory and events
    pub session_id: String,
    /// Model used when the router has no tier for a task
    pub default_model: String,
    /// Generation options passed to the provider
    pub generation: GenerationOptions,
    /// Checkpoint every N iterations (0 = never)
    pub checkpoint_interval: u32,
    /// Evaluation retries before committing a failing draft
    pub max_eval_retries: u32,
    /// How many recent events a compaction cycle summarizes
    pub compaction_window: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            session_id: Uuid::new_v4().to_string(),
            default_model: "gpt-4o-mini".to_string(),
            generation: GenerationOptions::balanced(),
            checkpoint_interval: 5,
            max_eval_retries: 1,
            compaction_window: 50,
        }
    }
}

/// Per-call options
#[derive(Clone, Default)]
pub struct ChatOptions {
    /// Override the configured iteration limit; `Some(None)` =
    /// unbounded
    pub max_iterations: Option<Option<u32>>,
    /// Cooperative cancellation
    pub cancellation: Option<CancellationToken>,
    /// Asked when the iteration limit is hit; returning `true`
    /// extends the run (and resets the iteration counter — legacy
    /// semantics, see stop tests)
    pub on_max_iterations: Option<Arc<dyn Fn(u32) -> bool + Send + Sync>>,
}

/// Callbacks for `stream`
#[derive(Clone, Default)]
pub struct StreamCallbacks {
    pub on_token: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_tool_start: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_tool_end: Option<Arc<dyn Fn(&ToolDispatchOutcome) + Send + Sync>>,
    /// Called exactly once if the run fails
    pub on_error: Option<Arc<dyn Fn(&Error) + Send + Sync>>,
}

/// A tool-using conversational agent
pub struct Agent {
    llm: Arc<dyn LlmClient>,
    registry: Arc<tokio::sync::RwLock<ToolRegistry>>,
    pipeline: ToolPipeline,
    memory: Option<MemoryManager>,
    compaction: Mutex<CompactionManager>,
    stop_config: StopConfig,
    api_recovery: RecoveryPolicy,
    machine: AgentStateMachine,
    checkpoints: CheckpointStore,
    router: ModelRouter,
    guardrail: Guardrail,
    evaluator: Option<Arc<dyn Evaluator>>,
    metrics: AgentMetrics,
    config: AgentConfig,
    history: Mutex<Vec<Message>>,
}

/// Builder for [`Agent`]
pub struct AgentBuilder {
    llm: Arc<dyn LlmClient>,
    registry: ToolRegistry,
    memory: Option<MemoryManager>,
    compaction: CompactionConfig,
    stop_config: StopConfig,
    api_recovery: Option<RecoveryPolicy>,
    tool_recovery: Option<RecoveryPolicy>,
    permissions: Option<PermissionPolicy>,
    pipeline_config: PipelineConfig,
    router: Option<ModelRouter>,
    guardrail: Guardrail,
    evaluator: Option<Arc<dyn Evaluator>>,
    config: AgentConfig,
}

impl AgentBuilder {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        AgentBuilder {
            llm,
            registry: ToolRegistry::new(),
            memory: None,
            compaction: CompactionConfig::default(),
            stop_config: StopConfig::standard(),
            api_recovery: None,
            tool_recovery: None,
            permissions: None,
            pipeline_config: PipelineConfig::default(),
            router: None,
            guardrail: Guardrail::new(),
            evaluator: None,
            config: AgentConfig::default(),
        }
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_memory(mut self, memory: MemoryManager) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_compaction(mut self, compaction: CompactionConfig) -> Self {
        self.compaction = compaction;
        self
    }

    pub fn with_stop_config(mut self, stop_config: StopConfig) -> Self {
        self.stop_config = stop_config;
        self
    }

    pub fn with_api_recovery(mut self, policy: RecoveryPolicy) -> Self {
        self.api_recovery = Some(policy);
        self
    }

    pub fn with_tool_recovery(mut self, policy: RecoveryPolicy) -> Self {
        self.tool_recovery = Some(policy);
        self
    }

    pub fn with_permissions(mut self, permissions: PermissionPolicy) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn with_pipeline_config(mut self, config: PipelineConfig) -> Self {
        self.pipeline_config = config;
        self
    }

    pub fn with_router(mut self, router: ModelRouter) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_guardrail(mut self, guardrail: Guardrail) -> Self {
        self.guardrail = guardrail;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn build(self) -> Agent {
        let metrics = AgentMetrics::new();
        let guardrail = self.guardrail;
        let permissions = Arc::new(self.permissions.unwrap_or_else(PermissionPolicy::allow_all));
        let tool_recovery = Arc::new(
            self.tool_recovery
                .unwrap_or_else(|| RecoveryPolicy::new("tool", RecoveryConfig::default())),
        );
        let pipeline = ToolPipeline::new(
            guardrail.clone(),
            permissions,
            tool_recovery,
            metrics.clone(),
            self.pipeline_config,
        );

        Agent {
            llm: self.llm,
            registry: Arc::new(tokio::sync::RwLock::new(self.registry)),
            pipeline,
            memory: self.memory,
            compaction: Mutex::new(CompactionManager::new(self.compaction)),
            stop_config: self.stop_config,
            api_recovery: self
                .api_recovery
                .unwrap_or_else(|| RecoveryPolicy::new("api", RecoveryConfig::default())),
            machine: AgentStateMachine::new(),
            checkpoints: CheckpointStore::default(),
            router: self
                .router
                .unwrap_or_else(|| ModelRouter::new(RouterConfig::single_model(
                    self.config.default_model.clone(),
                ))),
            guardrail,
            evaluator: self.evaluator,
            metrics,
            config: self.config,
            history: Mutex::new(Vec::new()),
        }
    }
}

impl Agent {
    /// Start building an agent around an LLM client
    pub fn builder(llm: Arc<dyn LlmClient>) -> AgentBuilder {
        AgentBuilder::new(llm)
    }

    /// Current lifecycle state
    pub fn state(&self) -> AgentState {
        self.machine.state()
    }

    /// Conversation history (without the system prompt)
    pub fn history(&self) -> Vec<Message> {
        self.history.lock().expect("history lock").clone()
    }

    /// Metrics recorder
    pub fn metrics(&self) -> &AgentMetrics {
        &self.metrics
    }

    /// Audit log of permission decisions
    pub fn audit_log(&self) -> Vec<crate::tools::AuditEntry> {
        self.pipeline.permissions().audit_log()
    }

    /// Saved checkpoints
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Register a tool. Takes effect from the next iteration; the
    /// current iteration keeps its registry snapshot.
    pub async fn add_tool<T: crate::tools::Tool + 'static>(&self, tool: T) {
        self.registry.write().await.register(tool);
    }

    /// Register every tool from a provider
    pub async fn add_provider(&self, provider: &dyn crate::tools::ToolProvider) -> Result<usize> {
        self.registry.write().await.register_provider(provider).await
    }

    /// Pause a running agent
    pub fn pause(&self) -> Result<()> {
        self.machine.handle(AgentEvent::Pause).map(|_| ())
    }

    /// Resume a paused agent
    pub fn resume(&self) -> Result<()> {
        self.machine.handle(AgentEvent::Resume).map(|_| ())
    }

    /// Rewind to a checkpoint, discarding work done since
    pub fn restore(&self, checkpoint_id: Uuid) -> Result<()> {
        let record = self
            .checkpoints
            .get(checkpoint_id)
            .ok_or_else(|| Error::NotFound(format!("checkpoint {}", checkpoint_id)))?;
        *self.history.lock().expect("history lock") = record.history.clone();
        self.machine.restore_to(record.state);
        info!(
            "Restored checkpoint {} ({}, iteration {})",
            record.id, record.name, record.iteration
        );
        Ok(())
    }

    /// Blocking conversation turn; returns once the model stops
    /// requesting tools.
    pub async fn chat(&self, input: &str, options: ChatOptions) -> Result<AgentResponse> {
        match self.run(input, &options, None).await {
            Ok(response) => Ok(response),
            Err(e) => {
                let _ = self.machine.handle(AgentEvent::Error);
                Err(e)
            }
        }
    }

    /// Streaming conversation turn; identical semantics to [`chat`]
    /// with incremental tokens via callbacks.
    ///
    /// [`chat`]: Agent::chat
    pub async fn stream(
        &self,
        input: &str,
        callbacks: StreamCallbacks,
        options: ChatOptions,
    ) -> Result<AgentResponse> {
        match self.run(input, &options, Some(&callbacks)).await {
            Ok(response) => Ok(response),
            Err(e) => {
                let _ = self.machine.handle(AgentEvent::Error);
                if let Some(ref on_error) = callbacks.on_error {
                    on_error(&e);
                }
                Err(e)
            }
        }
    }

    /// Single-turn completion: no history, no tools, no memory
    pub async fn complete(&self, prompt: &str, system_override: Option<&str>) -> Result<String> {
        let model = self
            .router
            .route(TaskType::Conversation)
            .map(|(_, c)| c.model_id.clone())
            .unwrap_or_else(|| self.config.default_model.clone());

        let request = ChatRequest {
            model,
            messages: vec![
                Message::system(system_override.unwrap_or(&self.config.system_prompt)),
                Message::user(prompt),
            ],
            options: self.config.generation.clone(),
            tools: Vec::new(),
        };

        let llm = self.llm.clone();
        let outcome = self
            .api_recovery
            .execute("complete", || {
                let request = request.clone();
                let llm = llm.clone();
                async move { llm.chat(request).await }
            })
            .await?;

        Ok(outcome.content.unwrap_or_default())
    }

    // -----------------------------------------------------------------
    // Core loop
    // -----------------------------------------------------------------

    async fn run(
        &self,
        input: &str,
        options: &ChatOptions,
        callbacks: Option<&StreamCallbacks>,
    ) -> Result<AgentResponse> {
        self.guardrail.apply_input(input)?;
        self.machine.handle(AgentEvent::Start)?;

        let session_id = self.config.session_id.clone();
        self.record_event(EventType::UserMsg, input).await;

        // Retrieve memory once per call, keyed by the user input
        let memory_section = match self.memory {
            Some(ref memory) => {
                let bundle = memory
                    .retriever
                    .retrieve(&RetrievalRequest {
                        session_id: Some(session_id.clone()),
                        query: Some(input.to_string()),
                        budget: None,
                    })
                    .await?;
                if bundle.recent_events.is_empty()
                    && bundle.profile.is_empty()
                    && bundle.retrieved_chunks.is_empty()
                    && bundle.task_state.is_none()
                    && bundle.summary.is_none()
                {
                    None
                } else {
                    Some(inject(&bundle)?)
                }
            }
            None => None,
        };

        self.history
            .lock()
            .expect("history lock")
            .push(Message::user(input));

        let mut stop_state = StopState::default();
        let mut stop_config = self.stop_config.clone();
        if let Some(override_limit) = options.max_iterations {
            stop_config.max_iterations = override_limit;
        }
        let unbounded = stop_config.max_iterations.is_none();
        let checker = StopChecker::new(stop_config)
            .with_soft_iterations(options.on_max_iterations.is_some() || unbounded);

        let mut tool_records: Vec<ToolCallRecord> = Vec::new();
        let mut total_usage = Usage::default();
        let mut compaction_summary: Option<String> = None;
        let mut eval_retries: u32 = 0;
        let mut iteration: u32 = 0;

        loop {
            self.check_cancelled(options)?;

            // Pre-flight stop check
            if let Some(decision) = checker.check(&stop_state).await {
                match self.resolve_stop(decision, &mut stop_state, options)? {
                    StopResolution::Continue => {}
                    StopResolution::Terminate(reason) => {
                        info!("Loop terminated: {}", reason);
                        self.machine.handle(AgentEvent::Complete)?;
                        return Ok(AgentResponse {
                            content: format!("Task stopped: {}", reason),
                            tool_calls: none_if_empty(tool_records),
                            usage: Some(total_usage),
                        });
                    }
                }
            }

            iteration += 1;
            self.metrics.record_iteration();
            debug!("Loop iteration {} (session {})", iteration, session_id);

            if self.config.checkpoint_interval > 0
                && iteration % self.config.checkpoint_interval == 0
            {
                self.save_checkpoint(iteration).await;
            }

            // Registry snapshot: tools added mid-iteration wait for the
            // next one
            let registry = self.registry.read().await.clone();
            let definitions = registry.definitions();

            let task_type = if definitions.is_empty() {
                TaskType::Conversation
            } else {
                TaskType::ToolSelection
            };
            let (tier, model) = match self.router.route(task_type) {
                Some((tier, config)) => (Some(tier), config.model_id.clone()),
                None => (None, self.config.default_model.clone()),
            };

            let system = compose_system_prompt(
                &self.config.system_prompt,
                memory_section.as_deref(),
                compaction_summary.as_deref(),
            );
            let mut messages = Vec::with_capacity(self.history().len() + 1);
            messages.push(Message::system(system));
            messages.extend(self.history());

            let request = ChatRequest {
                model,
                messages,
                options: self.config.generation.clone(),
                tools: definitions,
            };

            self.check_cancelled(options)?;

            let llm_start = Instant::now();
            let outcome = {
                let llm = self.llm.clone();
                let on_token = callbacks.and_then(|c| c.on_token.clone());
                let result = self
                    .api_recovery
                    .execute("llm_chat", || {
                        let request = request.clone();
                        let llm = llm.clone();
                        let on_token = on_token.clone();
                        async move {
                            match on_token {
                                Some(on_token) => {
                                    let sink = move |t: &str| on_token(t);
                                    llm.chat_stream(request, &sink).await
                                }
                                None => llm.chat(request).await,
                            }
                        }
                    })
                    .await;
                let duration_ms = llm_start.elapsed().as_millis() as u64;
                match result {
                    Ok(outcome) => {
                        self.metrics
                            .record_llm_call(duration_ms, outcome.usage.as_ref(), true);
                        outcome
                    }
                    Err(e) => {
                        self.metrics.record_llm_call(duration_ms, None, false);
                        stop_state.record_outcome(false);
                        return Err(e);
                    }
                }
            };
            stop_state.record_outcome(true);

            if let Some(usage) = outcome.usage {
                checker.record_usage(&mut stop_state, &usage);
                total_usage.accumulate(&usage);
                if let Some(tier) = tier {
                    self.router.record_usage(tier, &usage);
                }
                self.compaction
                    .lock()
                    .expect("compaction lock")
                    .record_usage(usage.prompt_tokens as u64, usage.completion_tokens as u64);
            }

            // Compaction: summarize and carry the short line into the
            // next iteration's system prompt
            if let Some(summary_line) = self.maybe_compact().await? {
                compaction_summary = Some(summary_line);
            }

            // --- Tool calls -------------------------------------------------
            if outcome.has_tool_calls() {
                let content = outcome.content.clone().unwrap_or_default();
                self.history
                    .lock()
                    .expect("history lock")
                    .push(Message::assistant_with_tool_calls(
                        content.clone(),
                        outcome.tool_calls.clone(),
                    ));

                self.machine.handle(AgentEvent::ToolStart)?;
                if let Some(callbacks) = callbacks {
                    if let Some(ref on_tool_start) = callbacks.on_tool_start {
                        for call in &outcome.tool_calls {
                            on_tool_start(&call.function.name);
                        }
                    }
                }

                let ctx = DispatchContext {
                    session_id: Some(session_id.clone()),
                    events: self.memory.as_ref().map(|m| m.events.clone()),
                    cancellation: options.cancellation.clone(),
                    surface_parse_errors: callbacks.is_none(),
                };
                let outcomes = self
                    .pipeline
                    .dispatch(&registry, &outcome.tool_calls, &ctx)
                    .await?;
                self.machine.handle(AgentEvent::ToolEnd)?;

                {
                    let mut compaction = self.compaction.lock().expect("compaction lock");
                    for _ in &outcomes {
                        compaction.record_event();
                    }
                }

                stop_state.tool_calls += outcomes.len() as u32;
                stop_state.last_tools = outcomes.iter().map(|o| o.name.clone()).collect();
                stop_state.last_content = outcome.content.clone();

                let mut history = self.history.lock().expect("history lock");
                for dispatched in &outcomes {
                    // Emission order, regardless of completion order
                    history.push(Message::tool(&dispatched.call_id, &dispatched.result));
                    stop_state.record_outcome(dispatched.success);
                    tool_records.push(ToolCallRecord {
                        name: dispatched.name.clone(),
                        args: dispatched.args.clone(),
                        result: dispatched.result.clone(),
                    });
                    if let Some(callbacks) = callbacks {
                        if let Some(ref on_tool_end) = callbacks.on_tool_end {
                            on_tool_end(dispatched);
                        }
                    }
                }
                drop(history);

                stop_state.iterations += 1;
                continue;
            }

            // --- Final response ---------------------------------------------
            let raw_content = outcome.content.clone().unwrap_or_default();
            let content = self.guardrail.apply_output(raw_content);
            stop_state.last_content = Some(content.clone());

            if let Some(ref evaluator) = self.evaluator {
                let eval_ctx = EvalContext {
                    original_request: input,
                    tool_results: &tool_records,
                    retry_count: eval_retries,
                    max_retries: self.config.max_eval_retries,
                };
                if eval_retries < self.config.max_eval_retries {
                    let eval = evaluator.evaluate(&content, &eval_ctx).await?;
                    if !eval.passed {
                        eval_retries += 1;
                        let feedback = eval.retry_reason.unwrap_or_else(|| {
                            "The previous answer was unsatisfactory. Please revise.".to_string()
                        });
                        warn!(
                            "Evaluation failed (score {:.2}), retrying ({}/{})",
                            eval.score, eval_retries, self.config.max_eval_retries
                        );
                        let mut history = self.history.lock().expect("history lock");
                        history.push(Message::assistant(content));
                        history.push(Message::user(feedback));
                        drop(history);
                        stop_state.iterations += 1;
                        continue;
                    }
                }
                // Consistency pass: reported, never blocking
                match evaluator.self_check(&content, &eval_ctx).await {
                    Ok(check) => {
                        for problem in &check.problems {
                            warn!("Self-check: {}", problem);
                        }
                    }
                    Err(e) => warn!("Self-check failed: {}", e),
                }
            }

            self.history
                .lock()
                .expect("history lock")
                .push(Message::assistant(content.clone()));
            self.record_event(EventType::AssistantMsg, &content).await;
            self.machine.handle(AgentEvent::Complete)?;

            info!(
                "Chat complete: {} iterations, {} tool calls, {} tokens",
                iteration,
                tool_records.len(),
                total_usage.total_tokens
            );

            return Ok(AgentResponse {
                content,
                tool_calls: none_if_empty(tool_records),
                usage: Some(total_usage),
            });
        }
    }

    fn check_cancelled(&self, options: &ChatOptions) -> Result<()> {
        if let Some(ref token) = options.cancellation {
            if token.is_cancelled() {
                return Err(Error::Aborted("chat cancelled".into()));
            }
        }
        Ok(())
    }

    fn resolve_stop(
        &self,
        decision: StopDecision,
        stop_state: &mut StopState,
        options: &ChatOptions,
    ) -> Result<StopResolution> {
        match decision.stop_type {
            StopType::Hard => Ok(StopResolution::Terminate(decision.reason)),
            StopType::Soft => {
                if let Some(ref on_max_iterations) = options.on_max_iterations {
                    if on_max_iterations(stop_state.iterations) {
                        info!("Continuation granted after soft stop: {}", decision.reason);
                        stop_state.reset_iterations();
                        return Ok(StopResolution::Continue);
                    }
                    return Ok(StopResolution::Terminate(decision.reason));
                }
                Err(Error::StopConditionHit(decision.reason))
            }
        }
    }

    async fn save_checkpoint(&self, iteration: u32) {
        let (plan, task_id) = match self.memory {
            Some(ref memory) => match memory
                .tasks
                .get_current(Some(&self.config.session_id))
                .await
            {
                Ok(Some(task)) => (task.plan.clone(), Some(task.id)),
                _ => (Vec::new(), None),
            },
            None => (Vec::new(), None),
        };

        let id = self.checkpoints.save(CheckpointRecord {
            id: Uuid::new_v4(),
            name: format!("iteration-{}", iteration),
            state: self.machine.state(),
            history: self.history(),
            plan,
            task_id,
            metrics: self.metrics.snapshot(),
            iteration,
            timestamp: chrono::Utc::now(),
        });
        debug!("Saved checkpoint {} at iteration {}", id, iteration);
    }

    /// Run a compaction cycle when the manager says so. Returns the
    /// summary short line to inject into the next system prompt.
    async fn maybe_compact(&self) -> Result<Option<String>> {
        let Some(ref memory) = self.memory else {
            return Ok(None);
        };
        {
            let compaction = self.compaction.lock().expect("compaction lock");
            if !compaction.should_flush() {
                return Ok(None);
            }
        }

        let events = memory
            .events
            .query(&EventQuery {
                session_id: Some(self.config.session_id.clone()),
                limit: Some(self.config.compaction_window),
                ..Default::default()
            })
            .await?;
        let previous = memory.summaries.latest(&self.config.session_id).await?;

        let summary = memory
            .summarizer
            .summarize(&self.config.session_id, &events, previous.as_ref())
            .await;
        memory.summaries.append(&summary).await?;

        let before = {
            let mut compaction = self.compaction.lock().expect("compaction lock");
            let tokens = compaction.tokens();
            compaction.reset();
            tokens
        };
        info!(
            "Compaction cycle complete: {} events summarized, {} tokens reclaimed",
            summary.covered_event_ids.len(),
            before
        );

        Ok(Some(summary.short))
    }

    async fn record_event(&self, event_type: EventType, content: &str) {
        let Some(ref memory) = self.memory else {
            return;
        };
        let event = MemoryEvent::new(event_type, &self.config.session_id)
            .with_summary(truncate_for_summary(content))
            .with_payload(serde_json::json!({ "content": content }));
        if let Err(e) = memory.events.append(&event).await {
            warn!("Failed to record {} event: {}", event_type, e);
        }
        self.compaction
            .lock()
            .expect("compaction lock")
            .record_event();
    }
}

enum StopResolution {
    Continue,
    Terminate(String),
}

fn none_if_empty(records: Vec<ToolCallRecord>) -> Option<Vec<ToolCallRecord>> {
    if records.is_empty() {
        None
    } else {
        Some(records)
    }
}

fn truncate_for_summary(text: &str) -> String {
    const MAX: usize = 140;
    if text.len() <= MAX {
        text.to_string()
    } else {
        let mut end = MAX;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    }
}
