//! Tool dispatch pipeline
//!
//! Per call: lookup → argument parse (bad JSON tolerated) → guardrail
//! → permission → timeout-bounded execution (optionally wrapped in the
//! tool recovery policy) → event + metric recording. Calls within one
//! model response run serially or concurrently, but the returned
//! outcomes always preserve the model's emission order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::permission::PermissionPolicy;
use super::registry::ToolRegistry;
use super::traits::{Tool, ToolResult};
use crate::agent::metrics::AgentMetrics;
use crate::agent::types::AssistantToolCall;
use crate::error::{Error, Result};
use crate::guardrail::Guardrail;
use crate::memory::{EventStore, EventType, MemoryEvent};
use crate::recovery::RecoveryPolicy;

/// Pipeline configuration
#[derive(Clone)]
pub struct PipelineConfig {
    /// Per-tool execution timeout
    pub tool_timeout: Duration,
    /// Dispatch calls within one response concurrently
    pub parallel_execution: bool,
    /// Concurrency bound for parallel dispatch; `None` = unbounded
    pub max_concurrent_tools: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            tool_timeout: Duration::from_secs(30),
            parallel_execution: true,
            max_concurrent_tools: None,
        }
    }
}

/// Everything the pipeline needs to know about the surrounding call
#[derive(Clone, Default)]
pub struct DispatchContext {
    /// Session to record events under
    pub session_id: Option<String>,
    /// Event store to record TOOL_CALL / TOOL_RESULT pairs in
    pub events: Option<EventStore>,
    /// Cooperative cancellation
    pub cancellation: Option<CancellationToken>,
    /// Include argument-parse errors in the result string (`chat`
    /// does, `stream` does not)
    pub surface_parse_errors: bool,
}

/// Tools whose arguments receive the session id from the loop; the
/// model never supplies it.
fn wants_session_injection(tool_name: &str) -> bool {
    tool_name.starts_with("memory_")
        || tool_name.starts_with("task_")
        || tool_name.starts_with("profile_")
}

/// The result of dispatching one tool call
#[derive(Debug, Clone)]
pub struct ToolDispatchOutcome {
    pub call_id: String,
    pub name: String,
    pub args: Value,
    /// Result string fed back to the model
    pub result: String,
    pub success: bool,
    /// Whether the tool body actually ran
    pub executed: bool,
    pub duration_ms: u64,
}

/// Tool dispatch pipeline
#[derive(Clone)]
pub struct ToolPipeline {
    guardrail: Guardrail,
    permissions: Arc<PermissionPolicy>,
    recovery: Arc<RecoveryPolicy>,
    metrics: AgentMetrics,
    config: PipelineConfig,
}

impl ToolPipeline {
    pub fn new(
        guardrail: Guardrail,
        permissions: Arc<PermissionPolicy>,
        recovery: Arc<RecoveryPolicy>,
        metrics: AgentMetrics,
        config: PipelineConfig,
    ) -> Self {
        ToolPipeline {
            guardrail,
            permissions,
            recovery,
            metrics,
            config,
        }
    }

    /// Access to the permission policy (audit log inspection)
    pub fn permissions(&self) -> &PermissionPolicy {
        &self.permissions
    }

    /// Dispatch every call of one model response against a registry
    /// snapshot. The returned outcomes are in emission order.
    pub async fn dispatch(
        &self,
        registry: &ToolRegistry,
        calls: &[AssistantToolCall],
        ctx: &DispatchContext,
    ) -> Result<Vec<ToolDispatchOutcome>> {
        if let Some(ref token) = ctx.cancellation {
            if token.is_cancelled() {
                return Err(Error::Aborted("tool dispatch cancelled".into()));
            }
        }

        if self.config.parallel_execution && calls.len() > 1 {
            let semaphore = self
                .config
                .max_concurrent_tools
                .map(|n| Arc::new(Semaphore::new(n.max(1))));

            let futures = calls.iter().map(|call| {
                let semaphore = semaphore.clone();
                async move {
                    let _permit = match semaphore {
                        Some(ref s) => Some(s.acquire().await.expect("semaphore closed")),
                        None => None,
                    };
                    self.dispatch_one(registry, call, ctx).await
                }
            });

            // join_all preserves input order regardless of completion order
            Ok(join_all(futures).await)
        } else {
            let mut outcomes = Vec::with_capacity(calls.len());
            for call in calls {
                if let Some(ref token) = ctx.cancellation {
                    if token.is_cancelled() {
                        return Err(Error::Aborted("tool dispatch cancelled".into()));
                    }
                }
                outcomes.push(self.dispatch_one(registry, call, ctx).await);
            }
            Ok(outcomes)
        }
    }

    async fn dispatch_one(
        &self,
        registry: &ToolRegistry,
        call: &AssistantToolCall,
        ctx: &DispatchContext,
    ) -> ToolDispatchOutcome {
        let name = call.function.name.clone();

        // 1. Lookup
        let Some(tool) = registry.get(&name) else {
            warn!("Model requested unknown tool {}", name);
            self.metrics.record_tool_call(&name, 0, false);
            return ToolDispatchOutcome {
                call_id: call.id.clone(),
                name: name.clone(),
                args: Value::Null,
                result: format!("Error: Unknown tool \"{}\"", name),
                success: false,
                executed: false,
                duration_ms: 0,
            };
        };

        // 2. Parse arguments, tolerating bad JSON
        let (mut args, parse_error) = match serde_json::from_str::<Value>(&call.function.arguments)
        {
            Ok(v) => (v, None),
            Err(e) => {
                warn!("Failed to parse arguments for {}: {}", name, e);
                (serde_json::json!({}), Some(e.to_string()))
            }
        };

        if wants_session_injection(&name) {
            if let (Some(session_id), Some(obj)) = (&ctx.session_id, args.as_object_mut()) {
                obj.insert(
                    "_session_id".to_string(),
                    Value::String(session_id.clone()),
                );
            }
        }

        // 3. Guardrail
        if let Some(reason) = self.guardrail.apply_tool_call(&name, &args) {
            self.metrics.record_tool_call(&name, 0, false);
            return ToolDispatchOutcome {
                call_id: call.id.clone(),
                name,
                args,
                result: reason,
                success: false,
                executed: false,
                duration_ms: 0,
            };
        }

        // 4. Permission
        if let Err(e) = self.permissions.authorize(tool.as_ref(), &args).await {
            self.metrics.record_tool_call(&name, 0, false);
            return ToolDispatchOutcome {
                call_id: call.id.clone(),
                name,
                args,
                result: format!("Error: {}", e),
                success: false,
                executed: false,
                duration_ms: 0,
            };
        }

        // 5-7. Execute under timeout, recording events around the call
        let call_event_id = self.record_call_event(ctx, &name, &args).await;

        let start = Instant::now();
        let execution = self.execute_with_timeout(tool.clone(), &name, &args).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let (mut result, success) = match execution {
            Ok(tool_result) if tool_result.success => {
                (tool_result.content.unwrap_or_default(), true)
            }
            Ok(tool_result) => (
                format!(
                    "Error executing tool: {}",
                    tool_result.error.unwrap_or_else(|| "unknown error".into())
                ),
                false,
            ),
            Err(e) => (format!("Error executing tool: {}", e), false),
        };

        if let Some(parse_error) = parse_error {
            if ctx.surface_parse_errors {
                result = format!(
                    "Warning: arguments were not valid JSON ({}). {}",
                    parse_error, result
                );
            }
        }

        debug!(
            "Tool {} finished in {}ms (success: {})",
            name, duration_ms, success
        );
        self.metrics.record_tool_call(&name, duration_ms, success);
        self.record_result_event(ctx, &name, call_event_id, &result, success)
            .await;

        ToolDispatchOutcome {
            call_id: call.id.clone(),
            name,
            args,
            result,
            success,
            executed: true,
            duration_ms,
        }
    }

    async fn execute_with_timeout(
        &self,
        tool: Arc<dyn Tool>,
        name: &str,
        args: &Value,
    ) -> Result<ToolResult> {
        let timeout = self.config.tool_timeout;
        let run = || async {
            match tokio::time::timeout(timeout, tool.execute(args.clone())).await {
                Ok(result) => result,
                Err(_) => Err(Error::ToolTimeout {
                    name: name.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }),
            }
        };

        if tool.retryable() {
            self.recovery.execute(name, run).await
        } else {
            run().await
        }
    }

    async fn record_call_event(
        &self,
        ctx: &DispatchContext,
        name: &str,
        args: &Value,
    ) -> Option<uuid::Uuid> {
        let (events, session_id) = match (&ctx.events, &ctx.session_id) {
            (Some(events), Some(session_id)) => (events, session_id),
            _ => return None,
        };

        let event = MemoryEvent::new(EventType::ToolCall, session_id)
            .with_summary(format!("call {}", name))
            .with_payload(serde_json::json!({ "tool": name, "args": args }));
        let id = event.id;
        if let Err(e) = events.append(&event).await {
            warn!("Failed to record TOOL_CALL event: {}", e);
            return None;
        }
        Some(id)
    }

    async fn record_result_event(
        &self,
        ctx: &DispatchContext,
        name: &str,
        parent: Option<uuid::Uuid>,
        result: &str,
        success: bool,
    ) {
        let (events, session_id) = match (&ctx.events, &ctx.session_id) {
            (Some(events), Some(session_id)) => (events, session_id),
            _ => return,
        };

        let mut event = MemoryEvent::new(EventType::ToolResult, session_id)
            .with_summary(format!("{} {}", name, if success { "ok" } else { "failed" }))
            .with_payload(serde_json::json!({ "tool": name, "result": result, "success": success }));
        if let Some(parent) = parent {
            event = event.with_parent(parent);
        }
        if let Err(e) = events.append(&event).await {
            warn!("Failed to record TOOL_RESULT event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::db::init_pool_in_memory;
    use crate::tools::permission::{PermissionLevel, PermissionRule};
    use crate::tools::registry::testing::{EchoTool, SleepTool};
    use crate::recovery::RecoveryConfig;

    fn pipeline(config: PipelineConfig) -> ToolPipeline {
        ToolPipeline::new(
            Guardrail::new(),
            Arc::new(PermissionPolicy::allow_all()),
            Arc::new(RecoveryPolicy::new("tool", RecoveryConfig::default())),
            AgentMetrics::new(),
            config,
        )
    }

    fn call(id: &str, name: &str, args: &str) -> AssistantToolCall {
        AssistantToolCall::function(id, name, args)
    }

    #[tokio::test]
    async fn executes_a_simple_call() {
        let pipeline = pipeline(PipelineConfig::default());
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);

        let outcomes = pipeline
            .dispatch(
                &registry,
                &[call("c1", "echo", r#"{"text":"hi"}"#)],
                &DispatchContext::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].success);
        assert!(outcomes[0].executed);
        assert_eq!(outcomes[0].result, "hi");
    }

    #[tokio::test]
    async fn unknown_tool_synthesizes_error_result() {
        let pipeline = pipeline(PipelineConfig::default());
        let registry = ToolRegistry::new();

        let outcomes = pipeline
            .dispatch(
                &registry,
                &[call("c1", "nope", "{}")],
                &DispatchContext::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcomes[0].result, "Error: Unknown tool \"nope\"");
        assert!(!outcomes[0].executed);
    }

    #[tokio::test]
    async fn bad_json_arguments_are_tolerated_and_surfaced() {
        let pipeline = pipeline(PipelineConfig::default());
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);

        // stream-style: silent
        let outcomes = pipeline
            .dispatch(
                &registry,
                &[call("c1", "echo", "{not json")],
                &DispatchContext::default(),
            )
            .await
            .unwrap();
        assert!(outcomes[0].executed);
        assert_eq!(outcomes[0].result, "");

        // chat-style: surfaced
        let outcomes = pipeline
            .dispatch(
                &registry,
                &[call("c1", "echo", "{not json")],
                &DispatchContext {
                    surface_parse_errors: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(outcomes[0]
            .result
            .starts_with("Warning: arguments were not valid JSON"));
    }

    #[tokio::test]
    async fn denied_tool_is_not_executed_and_audited_once() {
        let permissions = Arc::new(PermissionPolicy::new(vec![PermissionRule::new(
            "shell_*",
            PermissionLevel::Deny,
        )]));
        let pipeline = ToolPipeline::new(
            Guardrail::new(),
            permissions.clone(),
            Arc::new(RecoveryPolicy::new("tool", RecoveryConfig::default())),
            AgentMetrics::new(),
            PipelineConfig::default(),
        );

        let mut registry = ToolRegistry::new();
        registry.register_arc(
            Arc::new(SleepTool {
                name: "shell_exec".into(),
                sleep_ms: 0,
                output: "should not run".into(),
            }),
            "native",
        );

        let outcomes = pipeline
            .dispatch(
                &registry,
                &[call("c1", "shell_exec", r#"{"cmd":"rm"}"#)],
                &DispatchContext::default(),
            )
            .await
            .unwrap();

        assert_eq!(
            outcomes[0].result,
            "Error: Tool \"shell_exec\" is denied by permission policy"
        );
        assert!(!outcomes[0].executed);

        let audit = permissions.audit_log();
        assert_eq!(audit.len(), 1);
        assert!(!audit[0].executed);
    }

    #[tokio::test]
    async fn timeout_produces_tool_timeout_error_string() {
        let pipeline = pipeline(PipelineConfig {
            tool_timeout: Duration::from_millis(20),
            ..Default::default()
        });
        let mut registry = ToolRegistry::new();
        registry.register_arc(
            Arc::new(SleepTool {
                name: "slow".into(),
                sleep_ms: 500,
                output: "late".into(),
            }),
            "native",
        );

        let outcomes = pipeline
            .dispatch(
                &registry,
                &[call("c1", "slow", "{}")],
                &DispatchContext::default(),
            )
            .await
            .unwrap();

        assert!(!outcomes[0].success);
        assert!(outcomes[0].result.contains("timed out after 20ms"));
    }

    #[tokio::test]
    async fn parallel_dispatch_overlaps_and_preserves_emission_order() {
        let pipeline = pipeline(PipelineConfig {
            parallel_execution: true,
            max_concurrent_tools: Some(2),
            ..Default::default()
        });
        let mut registry = ToolRegistry::new();
        registry.register_arc(
            Arc::new(SleepTool {
                name: "slow_a".into(),
                sleep_ms: 200,
                output: "A".into(),
            }),
            "native",
        );
        registry.register_arc(
            Arc::new(SleepTool {
                name: "slow_b".into(),
                sleep_ms: 100,
                output: "B".into(),
            }),
            "native",
        );

        let start = Instant::now();
        let outcomes = pipeline
            .dispatch(
                &registry,
                &[call("c1", "slow_a", "{}"), call("c2", "slow_b", "{}")],
                &DispatchContext::default(),
            )
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert!(elapsed < Duration::from_millis(350), "took {:?}", elapsed);
        // slow_b finishes first but emission order is preserved
        assert_eq!(outcomes[0].result, "A");
        assert_eq!(outcomes[1].result, "B");
    }

    #[tokio::test]
    async fn serial_dispatch_runs_in_sequence() {
        let pipeline = pipeline(PipelineConfig {
            parallel_execution: false,
            ..Default::default()
        });
        let mut registry = ToolRegistry::new();
        registry.register_arc(
            Arc::new(SleepTool {
                name: "slow_a".into(),
                sleep_ms: 200,
                output: "A".into(),
            }),
            "native",
        );
        registry.register_arc(
            Arc::new(SleepTool {
                name: "slow_b".into(),
                sleep_ms: 100,
                output: "B".into(),
            }),
            "native",
        );

        let start = Instant::now();
        let outcomes = pipeline
            .dispatch(
                &registry,
                &[call("c1", "slow_a", "{}"), call("c2", "slow_b", "{}")],
                &DispatchContext::default(),
            )
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_millis(290));
        assert_eq!(outcomes[0].result, "A");
        assert_eq!(outcomes[1].result, "B");
    }

    #[tokio::test]
    async fn records_linked_call_and_result_events() {
        let pool = init_pool_in_memory().await.unwrap();
        let events = EventStore::new(pool);
        let pipeline = pipeline(PipelineConfig::default());
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);

        pipeline
            .dispatch(
                &registry,
                &[call("c1", "echo", r#"{"text":"hi"}"#)],
                &DispatchContext {
                    session_id: Some("s1".into()),
                    events: Some(events.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let all = events
            .query(&crate::memory::EventQuery {
                session_id: Some("s1".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(all.len(), 2);
        let result_event = all
            .iter()
            .find(|e| e.event_type == EventType::ToolResult)
            .unwrap();
        let call_event = all
            .iter()
            .find(|e| e.event_type == EventType::ToolCall)
            .unwrap();
        assert!(call_event.parent_id.is_none());
        assert_eq!(result_event.parent_id, Some(call_event.id));
    }

    #[tokio::test]
    async fn cancellation_aborts_dispatch() {
        let pipeline = pipeline(PipelineConfig::default());
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);

        let token = CancellationToken::new();
        token.cancel();

        let err = pipeline
            .dispatch(
                &registry,
                &[call("c1", "echo", "{}")],
                &DispatchContext {
                    cancellation: Some(token),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Aborted(_)));
    }
}
