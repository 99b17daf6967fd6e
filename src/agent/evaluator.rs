//! Answer evaluation (optional self-reflection)
//!
//! Reviews the assistant's proposed final answer before it is
//! committed. A failing evaluation makes the loop append feedback and
//! run another iteration while retries remain. The heuristic default
//! looks for empty, truncated, or self-contradicting drafts; swap in
//! an LLM-backed implementation through the trait.

use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;

use crate::agent::types::ToolCallRecord;
use crate::error::Result;

/// What the evaluator gets to see
pub struct EvalContext<'a> {
    pub original_request: &'a str,
    pub tool_results: &'a [ToolCallRecord],
    pub retry_count: u32,
    pub max_retries: u32,
}

/// Verdict on a draft answer
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Quality score in [0, 1]
    pub score: f64,
    pub passed: bool,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    /// Feedback injected into the prompt when retrying
    pub retry_reason: Option<String>,
}

impl Evaluation {
    pub fn pass(score: f64) -> Self {
        Evaluation {
            score,
            passed: true,
            issues: Vec::new(),
            suggestions: Vec::new(),
            retry_reason: None,
        }
    }
}

/// Non-blocking consistency check output
#[derive(Debug, Clone, Default)]
pub struct SelfCheck {
    pub problems: Vec<String>,
    pub corrections: Vec<String>,
}

/// Evaluates draft answers
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Score the draft; `passed = false` triggers a retry if any remain
    async fn evaluate(&self, draft: &str, ctx: &EvalContext<'_>) -> Result<Evaluation>;

    /// Optional consistency pass against tool results. Reports
    /// problems without blocking.
    async fn self_check(&self, _draft: &str, _ctx: &EvalContext<'_>) -> Result<SelfCheck> {
        Ok(SelfCheck::default())
    }
}

fn refusal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(i can(?:no|')t help|i'm unable to|as an ai i cannot)\b")
            .expect("static regex")
    })
}

fn denial_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(no results|nothing was found|could(?:n't| not) find)\b")
            .expect("static regex")
    })
}

/// Rule-based evaluator
#[derive(Debug, Clone, Default)]
pub struct HeuristicEvaluator {
    /// Score below which the draft fails (default 0.5)
    pub pass_threshold: Option<f64>,
}

impl HeuristicEvaluator {
    fn threshold(&self) -> f64 {
        self.pass_threshold.unwrap_or(0.5)
    }
}

#[async_trait]
impl Evaluator for HeuristicEvaluator {
    async fn evaluate(&self, draft: &str, ctx: &EvalContext<'_>) -> Result<Evaluation> {
        let trimmed = draft.trim();
        let mut score: f64 = 1.0;
        let mut issues = Vec::new();
        let mut suggestions = Vec::new();

        if trimmed.is_empty() {
            return Ok(Evaluation {
                score: 0.0,
                passed: false,
                issues: vec!["answer is empty".into()],
                suggestions: vec!["produce a substantive answer".into()],
                retry_reason: Some("The previous answer was empty. Answer the request.".into()),
            });
        }

        if trimmed.len() < 10 {
            score -= 0.6;
            issues.push("answer is suspiciously short".into());
            suggestions.push("expand the answer to address the request".into());
        }

        if refusal_re().is_match(trimmed) && !ctx.tool_results.is_empty() {
            score -= 0.4;
            issues.push("answer refuses despite successful tool results".into());
            suggestions.push("use the gathered tool results to answer".into());
        }

        if denial_re().is_match(trimmed)
            && ctx
                .tool_results
                .iter()
                .any(|r| !r.result.trim().is_empty() && !r.result.starts_with("Error"))
        {
            score -= 0.3;
            issues.push("answer claims nothing was found, but tool results exist".into());
        }

        let score = score.clamp(0.0, 1.0);
        let passed = score >= self.threshold();
        Ok(Evaluation {
            score,
            passed,
            retry_reason: if passed {
                None
            } else {
                Some(format!(
                    "The previous answer had problems: {}. Please revise.",
                    issues.join("; ")
                ))
            },
            issues,
            suggestions,
        })
    }

    async fn self_check(&self, draft: &str, ctx: &EvalContext<'_>) -> Result<SelfCheck> {
        let mut check = SelfCheck::default();

        for record in ctx.tool_results {
            if record.result.starts_with("Error") {
                continue;
            }
            if denial_re().is_match(draft) {
                check.problems.push(format!(
                    "draft denies results although tool {} returned output",
                    record.name
                ));
                check
                    .corrections
                    .push(format!("incorporate the result of {}", record.name));
            }
        }

        Ok(check)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(tool_results: &'a [ToolCallRecord], request: &'a str) -> EvalContext<'a> {
        EvalContext {
            original_request: request,
            tool_results,
            retry_count: 0,
            max_retries: 2,
        }
    }

    #[tokio::test]
    async fn empty_answer_fails_with_retry_reason() {
        let evaluator = HeuristicEvaluator::default();
        let eval = evaluator.evaluate("", &ctx(&[], "hi")).await.unwrap();
        assert!(!eval.passed);
        assert_eq!(eval.score, 0.0);
        assert!(eval.retry_reason.is_some());
    }

    #[tokio::test]
    async fn normal_answer_passes() {
        let evaluator = HeuristicEvaluator::default();
        let eval = evaluator
            .evaluate("The capital of France is Paris.", &ctx(&[], "capital?"))
            .await
            .unwrap();
        assert!(eval.passed);
        assert!(eval.issues.is_empty());
    }

    #[tokio::test]
    async fn denial_with_results_is_penalized() {
        let results = vec![ToolCallRecord {
            name: "web_search".into(),
            args: serde_json::json!({}),
            result: "three matching articles".into(),
        }];
        let evaluator = HeuristicEvaluator::default();
        let eval = evaluator
            .evaluate(
                "I couldn't find anything about that topic, no results anywhere.",
                &ctx(&results, "find articles"),
            )
            .await
            .unwrap();
        assert!(eval.score < 1.0);
        assert!(!eval.issues.is_empty());
    }

    #[tokio::test]
    async fn self_check_flags_contradictions_without_blocking() {
        let results = vec![ToolCallRecord {
            name: "db_query".into(),
            args: serde_json::json!({}),
            result: "42 rows".into(),
        }];
        let evaluator = HeuristicEvaluator::default();
        let check = evaluator
            .self_check("Nothing was found in the database.", &ctx(&results, "query"))
            .await
            .unwrap();
        assert_eq!(check.problems.len(), 1);
        assert_eq!(check.corrections.len(), 1);
    }
}
