//! Tool permission policy
//!
//! Rules are evaluated in declaration order; the first matching
//! pattern (exact name or glob) wins. When no rule matches, the tool's
//! category default applies, then the policy default. Confirmations go
//! through a caller-supplied handler and can be remembered for the
//! session. Every decision lands in the audit log.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::traits::{Tool, ToolCategory};
use crate::error::{Error, Result};

/// Decision level for a tool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionLevel {
    Allow,
    Confirm,
    Deny,
}

impl std::fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionLevel::Allow => write!(f, "allow"),
            PermissionLevel::Confirm => write!(f, "confirm"),
            PermissionLevel::Deny => write!(f, "deny"),
        }
    }
}

/// One permission rule
#[derive(Debug, Clone)]
pub struct PermissionRule {
    /// Exact tool name or glob (`shell_*`)
    pub tool_pattern: String,
    pub level: PermissionLevel,
}

impl PermissionRule {
    pub fn new(tool_pattern: impl Into<String>, level: PermissionLevel) -> Self {
        PermissionRule {
            tool_pattern: tool_pattern.into(),
            level,
        }
    }

    fn matches(&self, tool_name: &str) -> bool {
        if !self.tool_pattern.contains('*') {
            return self.tool_pattern == tool_name;
        }
        let pattern = format!("^{}$", regex::escape(&self.tool_pattern).replace(r"\*", ".*"));
        Regex::new(&pattern)
            .map(|re| re.is_match(tool_name))
            .unwrap_or(false)
    }
}

/// Context given to the confirmation handler
pub struct ConfirmRequest<'a> {
    pub tool_name: &'a str,
    pub args: &'a Value,
    pub description: &'a str,
    /// The rule pattern that triggered confirmation, if any
    pub matched_rule: Option<&'a str>,
}

/// The handler's answer
#[derive(Debug, Clone, Default)]
pub struct ConfirmDecision {
    pub allowed: bool,
    /// Remember the decision for this session
    pub remember: bool,
    pub message: Option<String>,
}

/// Asks the user (or an automated policy) to approve a tool call
#[async_trait]
pub trait ConfirmHandler: Send + Sync {
    async fn confirm(&self, request: &ConfirmRequest<'_>) -> ConfirmDecision;
}

/// One audited permission decision
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub tool_name: String,
    pub level: PermissionLevel,
    /// Whether the tool was cleared to execute
    pub executed: bool,
    /// How the decision was reached
    pub resolution: String,
}

/// Permission policy with ordered rules and category defaults
pub struct PermissionPolicy {
    rules: Vec<PermissionRule>,
    category_defaults: HashMap<ToolCategory, PermissionLevel>,
    default_level: PermissionLevel,
    session_memory: bool,
    remembered: Mutex<HashSet<String>>,
    handler: Option<Arc<dyn ConfirmHandler>>,
    audit: Mutex<Vec<AuditEntry>>,
}

impl PermissionPolicy {
    /// Policy with the standard category defaults and a `confirm`
    /// fallback.
    pub fn new(rules: Vec<PermissionRule>) -> Self {
        let mut category_defaults = HashMap::new();
        category_defaults.insert(ToolCategory::FilesystemRead, PermissionLevel::Allow);
        category_defaults.insert(ToolCategory::FilesystemWrite, PermissionLevel::Confirm);
        category_defaults.insert(ToolCategory::Network, PermissionLevel::Confirm);
        category_defaults.insert(ToolCategory::Shell, PermissionLevel::Confirm);
        category_defaults.insert(ToolCategory::Memory, PermissionLevel::Allow);

        PermissionPolicy {
            rules,
            category_defaults,
            default_level: PermissionLevel::Confirm,
            session_memory: true,
            remembered: Mutex::new(HashSet::new()),
            handler: None,
            audit: Mutex::new(Vec::new()),
        }
    }

    /// Policy that allows everything (tests, trusted tool sets)
    pub fn allow_all() -> Self {
        let mut policy = Self::new(Vec::new());
        policy.default_level = PermissionLevel::Allow;
        policy
    }

    /// Set the fallback level for unmatched tools
    pub fn with_default_level(mut self, level: PermissionLevel) -> Self {
        self.default_level = level;
        self
    }

    /// Override a category default
    pub fn with_category_default(mut self, category: ToolCategory, level: PermissionLevel) -> Self {
        self.category_defaults.insert(category, level);
        self
    }

    /// Install the confirmation handler
    pub fn with_handler(mut self, handler: Arc<dyn ConfirmHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Enable or disable session memory for confirmations
    pub fn with_session_memory(mut self, enabled: bool) -> Self {
        self.session_memory = enabled;
        self
    }

    /// Resolve the level for a tool: first matching rule wins, then
    /// category default, then policy default.
    fn resolve(&self, tool: &dyn Tool) -> (PermissionLevel, Option<&PermissionRule>) {
        for rule in &self.rules {
            if rule.matches(tool.name()) {
                return (rule.level, Some(rule));
            }
        }
        if let Some(category) = tool.category() {
            if let Some(level) = self.category_defaults.get(&category) {
                return (*level, None);
            }
        }
        (self.default_level, None)
    }

    /// Authorize a call. `Ok(())` means execute; an error carries the
    /// deny reason. Every decision is appended to the audit log.
    pub async fn authorize(&self, tool: &dyn Tool, args: &Value) -> Result<()> {
        let (level, matched) = self.resolve(tool);
        let name = tool.name();

        match level {
            PermissionLevel::Allow => {
                self.record(name, level, true, "allowed by policy");
                Ok(())
            }
            PermissionLevel::Deny => {
                warn!("Tool {} denied by permission policy", name);
                self.record(name, level, false, "denied by policy");
                Err(Error::PermissionDenied(name.to_string()))
            }
            PermissionLevel::Confirm => {
                if self.session_memory
                    && self.remembered.lock().expect("remembered lock").contains(name)
                {
                    debug!("Tool {} allowed from session memory", name);
                    self.record(name, level, true, "allowed from session memory");
                    return Ok(());
                }

                let Some(ref handler) = self.handler else {
                    self.record(name, level, false, "no confirmation handler");
                    return Err(Error::PermissionDenied(name.to_string()));
                };

                let decision = handler
                    .confirm(&ConfirmRequest {
                        tool_name: name,
                        args,
                        description: tool.description(),
                        matched_rule: matched.map(|r| r.tool_pattern.as_str()),
                    })
                    .await;

                if decision.allowed {
                    if self.session_memory && decision.remember {
                        self.remembered
                            .lock()
                            .expect("remembered lock")
                            .insert(name.to_string());
                    }
                    self.record(name, level, true, "confirmed by user");
                    Ok(())
                } else {
                    let resolution = decision
                        .message
                        .unwrap_or_else(|| "rejected by user".to_string());
                    self.record(name, level, false, &resolution);
                    Err(Error::PermissionDenied(name.to_string()))
                }
            }
        }
    }

    fn record(&self, tool_name: &str, level: PermissionLevel, executed: bool, resolution: &str) {
        self.audit.lock().expect("audit lock").push(AuditEntry {
            timestamp: Utc::now(),
            tool_name: tool_name.to_string(),
            level,
            executed,
            resolution: resolution.to_string(),
        });
    }

    /// Snapshot of the audit log
    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit.lock().expect("audit lock").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::registry::testing::EchoTool;
    use crate::tools::traits::ToolResult;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ShellTool;

    #[async_trait]
    impl Tool for ShellTool {
        fn name(&self) -> &str {
            "shell_exec"
        }
        fn description(&self) -> &str {
            "Run a shell command"
        }
        fn parameters_schema(&self) -> Value {
            serde_json::json!({})
        }
        fn category(&self) -> Option<ToolCategory> {
            Some(ToolCategory::Shell)
        }
        async fn execute(&self, _args: Value) -> Result<ToolResult> {
            Ok(ToolResult::success("ran"))
        }
    }

    struct AlwaysYes {
        remember: bool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ConfirmHandler for AlwaysYes {
        async fn confirm(&self, _request: &ConfirmRequest<'_>) -> ConfirmDecision {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ConfirmDecision {
                allowed: true,
                remember: self.remember,
                message: None,
            }
        }
    }

    #[test]
    fn glob_and_exact_patterns() {
        let rule = PermissionRule::new("shell_*", PermissionLevel::Deny);
        assert!(rule.matches("shell_exec"));
        assert!(!rule.matches("read_file"));

        let exact = PermissionRule::new("echo", PermissionLevel::Allow);
        assert!(exact.matches("echo"));
        assert!(!exact.matches("echo2"));
    }

    #[tokio::test]
    async fn deny_rule_wins_and_is_audited() {
        let policy = PermissionPolicy::new(vec![PermissionRule::new(
            "shell_*",
            PermissionLevel::Deny,
        )]);

        let err = policy
            .authorize(&ShellTool, &serde_json::json!({ "cmd": "rm" }))
            .await
            .unwrap_err();
        assert_eq!(
            format!("Error: {}", err),
            "Error: Tool \"shell_exec\" is denied by permission policy"
        );

        let audit = policy.audit_log();
        assert_eq!(audit.len(), 1);
        assert!(!audit[0].executed);
        assert_eq!(audit[0].tool_name, "shell_exec");
    }

    #[tokio::test]
    async fn first_matching_rule_wins() {
        let policy = PermissionPolicy::new(vec![
            PermissionRule::new("shell_exec", PermissionLevel::Allow),
            PermissionRule::new("shell_*", PermissionLevel::Deny),
        ]);

        assert!(policy
            .authorize(&ShellTool, &serde_json::json!({}))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn category_default_applies_without_rules() {
        // Shell category defaults to confirm; with no handler, that is
        // a deny.
        let policy = PermissionPolicy::new(Vec::new());
        assert!(policy
            .authorize(&ShellTool, &serde_json::json!({}))
            .await
            .is_err());

        // EchoTool has no category: policy default (confirm) applies
        let policy = PermissionPolicy::new(Vec::new()).with_default_level(PermissionLevel::Allow);
        assert!(policy
            .authorize(&EchoTool, &serde_json::json!({}))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn confirmation_with_remember_is_asked_once() {
        let handler = Arc::new(AlwaysYes {
            remember: true,
            calls: AtomicU32::new(0),
        });
        let policy = PermissionPolicy::new(Vec::new()).with_handler(handler.clone());

        policy
            .authorize(&ShellTool, &serde_json::json!({}))
            .await
            .unwrap();
        policy
            .authorize(&ShellTool, &serde_json::json!({}))
            .await
            .unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        let audit = policy.audit_log();
        assert_eq!(audit.len(), 2);
        assert!(audit.iter().all(|e| e.executed));
    }

    #[tokio::test]
    async fn session_memory_off_asks_every_time() {
        let handler = Arc::new(AlwaysYes {
            remember: true,
            calls: AtomicU32::new(0),
        });
        let policy = PermissionPolicy::new(Vec::new())
            .with_handler(handler.clone())
            .with_session_memory(false);

        policy
            .authorize(&ShellTool, &serde_json::json!({}))
            .await
            .unwrap();
        policy
            .authorize(&ShellTool, &serde_json::json!({}))
            .await
            .unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }
}
