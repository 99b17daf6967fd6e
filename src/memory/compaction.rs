//! Context compaction accounting
//!
//! Tracks cumulative prompt + completion tokens for a conversation and
//! tells the loop when to summarize-and-flush. Thresholds default to
//! 60% (soft) and 80% (hard) of the context budget; a critical state
//! means the reserve is already being eaten into.

use tracing::debug;

/// Compaction thresholds
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Total context budget in tokens
    pub max_context_tokens: u64,
    /// Soft threshold; `None` = 0.6 * max
    pub soft_threshold_tokens: Option<u64>,
    /// Hard threshold; `None` = 0.8 * max
    pub hard_threshold_tokens: Option<u64>,
    /// Tokens reserved for the next completion
    pub reserve_tokens: u64,
    /// Minimum events accumulated before a flush is worthwhile
    pub min_events_since_flush: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        CompactionConfig {
            max_context_tokens: 128_000,
            soft_threshold_tokens: None,
            hard_threshold_tokens: None,
            reserve_tokens: 4_096,
            min_events_since_flush: 3,
        }
    }
}

impl CompactionConfig {
    fn soft(&self) -> u64 {
        self.soft_threshold_tokens
            .unwrap_or(self.max_context_tokens * 6 / 10)
    }

    fn hard(&self) -> u64 {
        self.hard_threshold_tokens
            .unwrap_or(self.max_context_tokens * 8 / 10)
    }
}

/// Health of the working context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextHealth {
    /// Plenty of room
    Ok,
    /// Soft threshold crossed; flush soon
    Approaching,
    /// Hard threshold crossed; flush now
    FlushNow,
    /// Budget minus reserve exhausted
    Critical,
}

/// Per-conversation compaction manager
#[derive(Debug, Clone)]
pub struct CompactionManager {
    config: CompactionConfig,
    cumulative_tokens: u64,
    events_since_flush: u64,
}

impl CompactionManager {
    pub fn new(config: CompactionConfig) -> Self {
        CompactionManager {
            config,
            cumulative_tokens: 0,
            events_since_flush: 0,
        }
    }

    /// Record token usage from one LLM call
    pub fn record_usage(&mut self, prompt_tokens: u64, completion_tokens: u64) {
        self.cumulative_tokens += prompt_tokens + completion_tokens;
    }

    /// Record that an event was appended since the last flush
    pub fn record_event(&mut self) {
        self.events_since_flush += 1;
    }

    /// Cumulative tokens since the last flush
    pub fn tokens(&self) -> u64 {
        self.cumulative_tokens
    }

    /// Evaluate context health.
    ///
    /// A hard-threshold crossing is downgraded to `Approaching` while
    /// too few events have accumulated to make a useful summary;
    /// `Critical` ignores that gate.
    pub fn check_health(&self) -> ContextHealth {
        let critical_at = self
            .config
            .max_context_tokens
            .saturating_sub(self.config.reserve_tokens);

        if self.cumulative_tokens >= critical_at {
            return ContextHealth::Critical;
        }
        if self.cumulative_tokens >= self.config.hard() {
            if self.events_since_flush < self.config.min_events_since_flush {
                return ContextHealth::Approaching;
            }
            return ContextHealth::FlushNow;
        }
        if self.cumulative_tokens >= self.config.soft() {
            return ContextHealth::Approaching;
        }
        ContextHealth::Ok
    }

    /// Whether the loop should run a compaction cycle now
    pub fn should_flush(&self) -> bool {
        matches!(
            self.check_health(),
            ContextHealth::FlushNow | ContextHealth::Critical
        )
    }

    /// Reset accounting after a flush
    pub fn reset(&mut self) {
        debug!(
            "Compaction reset: {} tokens, {} events flushed",
            self.cumulative_tokens, self.events_since_flush
        );
        self.cumulative_tokens = 0;
        self.events_since_flush = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max: u64) -> CompactionManager {
        CompactionManager::new(CompactionConfig {
            max_context_tokens: max,
            reserve_tokens: 100,
            min_events_since_flush: 0,
            ..Default::default()
        })
    }

    #[test]
    fn health_progression() {
        let mut m = manager(1000);
        assert_eq!(m.check_health(), ContextHealth::Ok);

        m.record_usage(500, 100); // 600 >= soft (600)
        assert_eq!(m.check_health(), ContextHealth::Approaching);

        m.record_usage(150, 50); // 800 >= hard (800)
        assert_eq!(m.check_health(), ContextHealth::FlushNow);

        m.record_usage(100, 0); // 900 >= 1000 - 100
        assert_eq!(m.check_health(), ContextHealth::Critical);
    }

    #[test]
    fn min_events_gates_flush_but_not_critical() {
        let mut m = CompactionManager::new(CompactionConfig {
            max_context_tokens: 1000,
            reserve_tokens: 100,
            min_events_since_flush: 2,
            ..Default::default()
        });

        m.record_usage(800, 0);
        assert_eq!(m.check_health(), ContextHealth::Approaching);

        m.record_event();
        m.record_event();
        assert_eq!(m.check_health(), ContextHealth::FlushNow);

        m.record_usage(100, 0);
        assert_eq!(m.check_health(), ContextHealth::Critical);
    }

    #[test]
    fn reset_clears_accounting() {
        let mut m = manager(1000);
        m.record_usage(900, 0);
        m.record_event();
        assert!(m.should_flush());

        m.reset();
        assert_eq!(m.tokens(), 0);
        assert_eq!(m.check_health(), ContextHealth::Ok);
    }

    #[test]
    fn explicit_thresholds_override_ratios() {
        let m = CompactionManager::new(CompactionConfig {
            max_context_tokens: 1000,
            soft_threshold_tokens: Some(500),
            hard_threshold_tokens: Some(900),
            reserve_tokens: 0,
            min_events_since_flush: 0,
        });
        assert_eq!(m.config.soft(), 500);
        assert_eq!(m.config.hard(), 900);
    }
}
