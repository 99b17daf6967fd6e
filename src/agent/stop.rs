//! Stop-condition evaluation
//!
//! Consulted once per loop iteration. Hard limits (iterations, tool
//! calls, tokens, duration, cost, consecutive failures) are checked
//! before soft ones (content patterns, stop-on-tool, custom
//! conditions); the first match wins. `max_iterations` turns soft when
//! a continuation callback is available.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;

use crate::agent::types::Usage;
use crate::error::{Error, Result};

/// Per-1K token pricing for cost limits
#[derive(Debug, Clone)]
pub struct CostLimit {
    pub max_cost: f64,
    pub input_cost_per_1k: f64,
    pub output_cost_per_1k: f64,
}

/// A content pattern that requests a stop
#[derive(Debug, Clone)]
pub enum StopPattern {
    /// Substring match
    Literal(String),
    /// Regular expression match
    Pattern(Regex),
}

impl StopPattern {
    /// Compile a regex stop pattern
    pub fn regex(pattern: &str) -> Result<Self> {
        Ok(StopPattern::Pattern(Regex::new(pattern).map_err(|e| {
            Error::InvalidInput(format!("Invalid stop pattern: {}", e))
        })?))
    }

    fn matches(&self, text: &str) -> bool {
        match self {
            StopPattern::Literal(s) => text.contains(s.as_str()),
            StopPattern::Pattern(re) => re.is_match(text),
        }
    }
}

/// Configurable limits
#[derive(Clone, Default)]
pub struct StopConfig {
    /// `None` = unbounded
    pub max_iterations: Option<u32>,
    pub max_tool_calls: Option<u32>,
    pub max_total_tokens: Option<u64>,
    pub max_completion_tokens: Option<u64>,
    pub max_duration: Option<Duration>,
    pub max_cost: Option<CostLimit>,
    pub stop_patterns: Vec<StopPattern>,
    /// Stop after any of these tools ran
    pub stop_on_tools: Vec<String>,
    pub max_consecutive_failures: Option<u32>,
    /// User condition, evaluated last
    pub custom: Option<Arc<dyn StopCondition>>,
}

impl StopConfig {
    /// The loop default: 10 iterations, 3 consecutive failures
    pub fn standard() -> Self {
        StopConfig {
            max_iterations: Some(10),
            max_consecutive_failures: Some(3),
            ..Default::default()
        }
    }
}

/// Soft stops consult the continuation callback; hard stops terminate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopType {
    Soft,
    Hard,
}

/// A stop verdict
#[derive(Debug, Clone)]
pub struct StopDecision {
    pub stop_type: StopType,
    pub reason: String,
    pub suggestion: Option<String>,
}

impl StopDecision {
    pub fn hard(reason: impl Into<String>) -> Self {
        StopDecision {
            stop_type: StopType::Hard,
            reason: reason.into(),
            suggestion: None,
        }
    }

    pub fn soft(reason: impl Into<String>) -> Self {
        StopDecision {
            stop_type: StopType::Soft,
            reason: reason.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// User-supplied stop condition
#[async_trait]
pub trait StopCondition: Send + Sync {
    /// Return a decision to request a stop, `None` to continue
    async fn evaluate(&self, state: &StopState) -> Option<StopDecision>;
}

/// Wrap a sync closure as a [`StopCondition`]
pub struct FnCondition<F>(pub F);

#[async_trait]
impl<F> StopCondition for FnCondition<F>
where
    F: Fn(&StopState) -> Option<StopDecision> + Send + Sync,
{
    async fn evaluate(&self, state: &StopState) -> Option<StopDecision> {
        (self.0)(state)
    }
}

/// Mutable counters owned by the loop
#[derive(Debug, Clone)]
pub struct StopState {
    /// Completed iterations
    pub iterations: u32,
    pub tool_calls: u32,
    pub total_tokens: u64,
    pub completion_tokens: u64,
    pub started_at: Instant,
    pub cost: f64,
    pub consecutive_failures: u32,
    /// Content of the last assistant message, for pattern checks
    pub last_content: Option<String>,
    /// Tools executed in the last iteration
    pub last_tools: Vec<String>,
}

impl Default for StopState {
    fn default() -> Self {
        StopState {
            iterations: 0,
            tool_calls: 0,
            total_tokens: 0,
            completion_tokens: 0,
            started_at: Instant::now(),
            cost: 0.0,
            consecutive_failures: 0,
            last_content: None,
            last_tools: Vec::new(),
        }
    }
}

impl StopState {
    /// Record the outcome of an LLM or tool call for the
    /// consecutive-failure counter: failures increment, any success
    /// resets.
    pub fn record_outcome(&mut self, success: bool) {
        if success {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
    }

    /// Legacy continuation semantics: extending the run resets the
    /// iteration counter, and the checker sees the reset value.
    pub fn reset_iterations(&mut self) {
        self.iterations = 0;
    }
}

/// The policy object consulted once per iteration
#[derive(Clone)]
pub struct StopChecker {
    config: StopConfig,
    /// Set when the caller supplied a continuation callback or enabled
    /// infinite-loop mode
    iterations_soft: bool,
}

impl StopChecker {
    pub fn new(config: StopConfig) -> Self {
        StopChecker {
            config,
            iterations_soft: false,
        }
    }

    /// Make the iteration limit soft (continuation callback present)
    pub fn with_soft_iterations(mut self, soft: bool) -> Self {
        self.iterations_soft = soft;
        self
    }

    /// Fold usage from one LLM call into the state, including cost
    pub fn record_usage(&self, state: &mut StopState, usage: &Usage) {
        state.total_tokens += usage.total_tokens as u64;
        state.completion_tokens += usage.completion_tokens as u64;
        if let Some(ref cost) = self.config.max_cost {
            state.cost += usage.prompt_tokens as f64 / 1000.0 * cost.input_cost_per_1k
                + usage.completion_tokens as f64 / 1000.0 * cost.output_cost_per_1k;
        }
    }

    /// Evaluate all conditions against the state; first match wins
    pub async fn check(&self, state: &StopState) -> Option<StopDecision> {
        // Hard limits first
        if let Some(max) = self.config.max_iterations {
            if state.iterations >= max {
                let reason = format!("max iterations reached ({})", max);
                let decision = if self.iterations_soft {
                    StopDecision::soft(reason)
                } else {
                    StopDecision::hard(reason)
                };
                return Some(
                    decision.with_suggestion("increase maxIterations or simplify the request"),
                );
            }
        }

        if let Some(max) = self.config.max_tool_calls {
            if state.tool_calls >= max {
                return Some(StopDecision::hard(format!(
                    "max tool calls reached ({})",
                    max
                )));
            }
        }

        if let Some(max) = self.config.max_total_tokens {
            if state.total_tokens >= max {
                return Some(StopDecision::hard(format!(
                    "token budget exhausted ({} tokens)",
                    max
                )));
            }
        }

        if let Some(max) = self.config.max_completion_tokens {
            if state.completion_tokens >= max {
                return Some(StopDecision::hard(format!(
                    "completion token budget exhausted ({} tokens)",
                    max
                )));
            }
        }

        if let Some(max) = self.config.max_duration {
            if state.started_at.elapsed() >= max {
                return Some(StopDecision::hard(format!(
                    "time limit reached ({:?})",
                    max
                )));
            }
        }

        if let Some(ref limit) = self.config.max_cost {
            if state.cost >= limit.max_cost {
                return Some(StopDecision::hard(format!(
                    "cost limit reached (${:.4})",
                    limit.max_cost
                )));
            }
        }

        if let Some(max) = self.config.max_consecutive_failures {
            if state.consecutive_failures >= max {
                return Some(
                    StopDecision::hard(format!("{} consecutive failures", max))
                        .with_suggestion("check tool health and provider status"),
                );
            }
        }

        // Soft limits
        if let Some(ref content) = state.last_content {
            if let Some(pattern) = self.config.stop_patterns.iter().find(|p| p.matches(content)) {
                let what = match pattern {
                    StopPattern::Literal(s) => s.clone(),
                    StopPattern::Pattern(re) => re.as_str().to_string(),
                };
                return Some(StopDecision::soft(format!(
                    "stop pattern matched: {}",
                    what
                )));
            }
        }

        if let Some(tool) = state
            .last_tools
            .iter()
            .find(|t| self.config.stop_on_tools.iter().any(|s| s == *t))
        {
            return Some(StopDecision::soft(format!("stop-on-tool {} executed", tool)));
        }

        if let Some(ref custom) = self.config.custom {
            if let Some(decision) = custom.evaluate(state).await {
                return Some(decision);
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> StopState {
        StopState::default()
    }

    #[tokio::test]
    async fn iteration_limit_is_hard_by_default() {
        let checker = StopChecker::new(StopConfig {
            max_iterations: Some(3),
            ..Default::default()
        });

        let mut s = state();
        s.iterations = 2;
        assert!(checker.check(&s).await.is_none());

        s.iterations = 3;
        let decision = checker.check(&s).await.unwrap();
        assert_eq!(decision.stop_type, StopType::Hard);
        assert_eq!(decision.reason, "max iterations reached (3)");
    }

    #[tokio::test]
    async fn iteration_limit_softens_with_continuation() {
        let checker = StopChecker::new(StopConfig {
            max_iterations: Some(1),
            ..Default::default()
        })
        .with_soft_iterations(true);

        let mut s = state();
        s.iterations = 1;
        assert_eq!(checker.check(&s).await.unwrap().stop_type, StopType::Soft);
    }

    #[tokio::test]
    async fn resets_iteration_counter_when_extended() {
        // Legacy continuation semantics: the checker is informed after
        // the reset, so the next check passes.
        let checker = StopChecker::new(StopConfig {
            max_iterations: Some(2),
            ..Default::default()
        })
        .with_soft_iterations(true);

        let mut s = state();
        s.iterations = 2;
        assert!(checker.check(&s).await.is_some());

        s.reset_iterations();
        assert!(checker.check(&s).await.is_none());
    }

    #[tokio::test]
    async fn hard_limits_win_over_soft_matches() {
        let checker = StopChecker::new(StopConfig {
            max_total_tokens: Some(100),
            stop_patterns: vec![StopPattern::Literal("DONE".into())],
            ..Default::default()
        });

        let mut s = state();
        s.total_tokens = 150;
        s.last_content = Some("DONE".into());

        let decision = checker.check(&s).await.unwrap();
        assert_eq!(decision.stop_type, StopType::Hard);
        assert!(decision.reason.contains("token budget"));
    }

    #[tokio::test]
    async fn cost_accumulates_from_usage() {
        let checker = StopChecker::new(StopConfig {
            max_cost: Some(CostLimit {
                max_cost: 0.01,
                input_cost_per_1k: 0.01,
                output_cost_per_1k: 0.03,
            }),
            ..Default::default()
        });

        let mut s = state();
        checker.record_usage(
            &mut s,
            &Usage {
                prompt_tokens: 500,
                completion_tokens: 100,
                total_tokens: 600,
            },
        );
        assert!((s.cost - 0.008).abs() < 1e-9);
        assert!(checker.check(&s).await.is_none());

        checker.record_usage(
            &mut s,
            &Usage {
                prompt_tokens: 500,
                completion_tokens: 0,
                total_tokens: 500,
            },
        );
        let decision = checker.check(&s).await.unwrap();
        assert!(decision.reason.contains("cost limit"));
    }

    #[tokio::test]
    async fn regex_and_literal_patterns_are_soft() {
        let checker = StopChecker::new(StopConfig {
            stop_patterns: vec![
                StopPattern::Literal("TERMINATE".into()),
                StopPattern::regex(r"(?i)task\s+complete").unwrap(),
            ],
            ..Default::default()
        });

        let mut s = state();
        s.last_content = Some("ok, Task Complete!".into());
        let decision = checker.check(&s).await.unwrap();
        assert_eq!(decision.stop_type, StopType::Soft);
    }

    #[tokio::test]
    async fn consecutive_failures_trip_and_reset() {
        let checker = StopChecker::new(StopConfig {
            max_consecutive_failures: Some(2),
            ..Default::default()
        });

        let mut s = state();
        s.record_outcome(false);
        s.record_outcome(false);
        assert!(checker.check(&s).await.is_some());

        s.record_outcome(true);
        assert_eq!(s.consecutive_failures, 0);
        assert!(checker.check(&s).await.is_none());
    }

    #[tokio::test]
    async fn stop_on_tool_fires_after_the_tool_ran() {
        let checker = StopChecker::new(StopConfig {
            stop_on_tools: vec!["submit_form".into()],
            ..Default::default()
        });

        let mut s = state();
        s.last_tools = vec!["echo".into()];
        assert!(checker.check(&s).await.is_none());

        s.last_tools = vec!["submit_form".into()];
        let decision = checker.check(&s).await.unwrap();
        assert!(decision.reason.contains("submit_form"));
    }

    #[tokio::test]
    async fn custom_condition_runs_last() {
        let checker = StopChecker::new(StopConfig {
            custom: Some(Arc::new(FnCondition(|s: &StopState| {
                if s.tool_calls > 5 {
                    Some(StopDecision::soft("too chatty"))
                } else {
                    None
                }
            }))),
            ..Default::default()
        });

        let mut s = state();
        assert!(checker.check(&s).await.is_none());
        s.tool_calls = 6;
        assert_eq!(checker.check(&s).await.unwrap().reason, "too chatty");
    }
}
