//! Execution metrics
//!
//! Cheap counters recorded by the loop and the tool pipeline.
//! `snapshot()` returns a clone so checkpoints can capture metrics
//! without holding the lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::agent::types::Usage;

/// Per-tool counters
#[derive(Debug, Clone, Default)]
pub struct ToolStats {
    pub calls: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
}

/// Aggregated metrics snapshot
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub iterations: u64,
    pub llm_calls: u64,
    pub llm_failures: u64,
    pub llm_total_duration_ms: u64,
    pub usage: Usage,
    pub tools: HashMap<String, ToolStats>,
}

/// Shared metrics recorder
#[derive(Clone, Default)]
pub struct AgentMetrics {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl AgentMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_iteration(&self) {
        self.inner.lock().expect("metrics lock").iterations += 1;
    }

    pub fn record_llm_call(&self, duration_ms: u64, usage: Option<&Usage>, success: bool) {
        let mut m = self.inner.lock().expect("metrics lock");
        m.llm_calls += 1;
        m.llm_total_duration_ms += duration_ms;
        if !success {
            m.llm_failures += 1;
        }
        if let Some(usage) = usage {
            m.usage.accumulate(usage);
        }
    }

    pub fn record_tool_call(&self, name: &str, duration_ms: u64, success: bool) {
        let mut m = self.inner.lock().expect("metrics lock");
        let stats = m.tools.entry(name.to_string()).or_default();
        stats.calls += 1;
        stats.total_duration_ms += duration_ms;
        if !success {
            stats.failures += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().expect("metrics lock").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_snapshots() {
        let metrics = AgentMetrics::new();
        metrics.record_iteration();
        metrics.record_llm_call(
            120,
            Some(&Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
            true,
        );
        metrics.record_tool_call("echo", 4, true);
        metrics.record_tool_call("echo", 6, false);

        let snap = metrics.snapshot();
        assert_eq!(snap.iterations, 1);
        assert_eq!(snap.llm_calls, 1);
        assert_eq!(snap.usage.total_tokens, 15);

        let echo = &snap.tools["echo"];
        assert_eq!(echo.calls, 2);
        assert_eq!(echo.failures, 1);
        assert_eq!(echo.total_duration_ms, 10);
    }
}
