//! Cost-aware model routing
//!
//! Three tiers, each annotated with pricing, context size, and the
//! task types it supports. `route` is a pure function of the
//! configuration; usage accounting and the daily cost limit live
//! behind a mutex and fire the user callbacks at the edges.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::agent::types::Usage;

/// Model tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModelTier {
    Fast,
    Standard,
    Strong,
}

/// What a model call is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    Conversation,
    ToolSelection,
    Summarization,
    Evaluation,
}

/// Routing preference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostOptimization {
    Cost,
    Balanced,
    Quality,
}

/// Per-tier annotation
#[derive(Debug, Clone)]
pub struct TierConfig {
    pub model_id: String,
    pub input_cost_per_1k: f64,
    pub output_cost_per_1k: f64,
    pub max_context: u64,
    pub supported_tasks: Vec<TaskType>,
    /// 1 = fastest
    pub latency_tier: u8,
    /// 1 = strongest
    pub quality_tier: u8,
}

impl TierConfig {
    fn combined_cost(&self) -> f64 {
        self.input_cost_per_1k + self.output_cost_per_1k
    }
}

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub tiers: HashMap<ModelTier, TierConfig>,
    pub cost_optimization: CostOptimization,
    /// Daily cost ceiling in dollars
    pub daily_cost_limit: Option<f64>,
    /// Fraction of the limit at which the warning fires
    pub warn_ratio: f64,
}

impl RouterConfig {
    /// All tiers backed by one model; routing degenerates but cost
    /// accounting still works.
    pub fn single_model(model_id: impl Into<String>) -> Self {
        let model_id = model_id.into();
        let tier = TierConfig {
            model_id,
            input_cost_per_1k: 0.0,
            output_cost_per_1k: 0.0,
            max_context: 128_000,
            supported_tasks: vec![
                TaskType::Conversation,
                TaskType::ToolSelection,
                TaskType::Summarization,
                TaskType::Evaluation,
            ],
            latency_tier: 2,
            quality_tier: 2,
        };
        let mut tiers = HashMap::new();
        tiers.insert(ModelTier::Fast, tier.clone());
        tiers.insert(ModelTier::Standard, tier.clone());
        tiers.insert(ModelTier::Strong, tier);

        RouterConfig {
            tiers,
            cost_optimization: CostOptimization::Balanced,
            daily_cost_limit: None,
            warn_ratio: 0.8,
        }
    }
}

/// Cost accumulated for one tier
#[derive(Debug, Clone, Copy, Default)]
pub struct TierCost {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

/// Running totals by tier
#[derive(Debug, Clone, Default)]
pub struct CostStats {
    pub by_tier: HashMap<ModelTier, TierCost>,
    pub total_cost: f64,
}

#[derive(Default)]
struct RouterState {
    stats: CostStats,
    warning_fired: bool,
    limit_fired: bool,
}

type CostCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// The router
#[derive(Clone)]
pub struct ModelRouter {
    config: RouterConfig,
    state: Arc<Mutex<RouterState>>,
    on_cost_warning: Option<CostCallback>,
    on_cost_limit_reached: Option<CostCallback>,
}

impl ModelRouter {
    pub fn new(config: RouterConfig) -> Self {
        ModelRouter {
            config,
            state: Arc::new(Mutex::new(RouterState::default())),
            on_cost_warning: None,
            on_cost_limit_reached: None,
        }
    }

    pub fn on_cost_warning(mut self, cb: impl Fn(f64) + Send + Sync + 'static) -> Self {
        self.on_cost_warning = Some(Arc::new(cb));
        self
    }

    pub fn on_cost_limit_reached(mut self, cb: impl Fn(f64) + Send + Sync + 'static) -> Self {
        self.on_cost_limit_reached = Some(Arc::new(cb));
        self
    }

    /// Select a tier for a task. Pure for a fixed configuration.
    ///
    /// `cost`: the cheapest supporting tier. `quality`: the strongest
    /// supporting tier. `balanced`: standard when it supports the
    /// task, else the cheapest supporting tier.
    pub fn route(&self, task_type: TaskType) -> Option<(ModelTier, &TierConfig)> {
        let supports = |tier: &ModelTier| {
            self.config
                .tiers
                .get(tier)
                .filter(|c| c.supported_tasks.contains(&task_type))
                .map(|c| (*tier, c))
        };

        let mut candidates: Vec<(ModelTier, &TierConfig)> = [
            ModelTier::Fast,
            ModelTier::Standard,
            ModelTier::Strong,
        ]
        .iter()
        .filter_map(supports)
        .collect();

        if candidates.is_empty() {
            return None;
        }

        match self.config.cost_optimization {
            CostOptimization::Cost => {
                candidates.sort_by(|a, b| {
                    a.1.combined_cost()
                        .total_cmp(&b.1.combined_cost())
                        .then(a.0.cmp(&b.0))
                });
                candidates.into_iter().next()
            }
            CostOptimization::Quality => {
                candidates.sort_by(|a, b| {
                    a.1.quality_tier.cmp(&b.1.quality_tier).then(a.0.cmp(&b.0))
                });
                candidates.into_iter().next()
            }
            CostOptimization::Balanced => candidates
                .iter()
                .find(|(t, _)| *t == ModelTier::Standard)
                .copied()
                .or_else(|| {
                    candidates.sort_by(|a, b| {
                        a.1.combined_cost()
                            .total_cmp(&b.1.combined_cost())
                            .then(a.0.cmp(&b.0))
                    });
                    candidates.into_iter().next()
                }),
        }
    }

    /// Record usage against a tier and update cost accounting
    pub fn record_usage(&self, tier: ModelTier, usage: &Usage) {
        let Some(tier_config) = self.config.tiers.get(&tier) else {
            return;
        };
        let call_cost = usage.prompt_tokens as f64 / 1000.0 * tier_config.input_cost_per_1k
            + usage.completion_tokens as f64 / 1000.0 * tier_config.output_cost_per_1k;

        let mut state = self.state.lock().expect("router lock");
        let entry = state.stats.by_tier.entry(tier).or_default();
        entry.input_tokens += usage.prompt_tokens as u64;
        entry.output_tokens += usage.completion_tokens as u64;
        entry.cost += call_cost;
        state.stats.total_cost += call_cost;

        let total = state.stats.total_cost;
        if let Some(limit) = self.config.daily_cost_limit {
            if total >= limit && !state.limit_fired {
                state.limit_fired = true;
                warn!("Daily cost limit reached: ${:.4}", total);
                if let Some(ref cb) = self.on_cost_limit_reached {
                    cb(total);
                }
            } else if total >= limit * self.config.warn_ratio && !state.warning_fired {
                state.warning_fired = true;
                info!("Approaching daily cost limit: ${:.4}", total);
                if let Some(ref cb) = self.on_cost_warning {
                    cb(total);
                }
            }
        }
    }

    /// Running cost totals by tier
    pub fn cost_stats(&self) -> CostStats {
        self.state.lock().expect("router lock").stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn three_tier(optimization: CostOptimization) -> RouterConfig {
        let mut tiers = HashMap::new();
        tiers.insert(
            ModelTier::Fast,
            TierConfig {
                model_id: "mini".into(),
                input_cost_per_1k: 0.0001,
                output_cost_per_1k: 0.0004,
                max_context: 16_000,
                supported_tasks: vec![TaskType::Conversation, TaskType::Summarization],
                latency_tier: 1,
                quality_tier: 3,
            },
        );
        tiers.insert(
            ModelTier::Standard,
            TierConfig {
                model_id: "mid".into(),
                input_cost_per_1k: 0.001,
                output_cost_per_1k: 0.002,
                max_context: 128_000,
                supported_tasks: vec![
                    TaskType::Conversation,
                    TaskType::ToolSelection,
                    TaskType::Summarization,
                ],
                latency_tier: 2,
                quality_tier: 2,
            },
        );
        tiers.insert(
            ModelTier::Strong,
            TierConfig {
                model_id: "big".into(),
                input_cost_per_1k: 0.01,
                output_cost_per_1k: 0.03,
                max_context: 200_000,
                supported_tasks: vec![
                    TaskType::Conversation,
                    TaskType::ToolSelection,
                    TaskType::Evaluation,
                ],
                latency_tier: 3,
                quality_tier: 1,
            },
        );
        RouterConfig {
            tiers,
            cost_optimization: optimization,
            daily_cost_limit: None,
            warn_ratio: 0.8,
        }
    }

    #[test]
    fn cost_preference_picks_cheapest_supporting_tier() {
        let router = ModelRouter::new(three_tier(CostOptimization::Cost));

        let (tier, config) = router.route(TaskType::Conversation).unwrap();
        assert_eq!(tier, ModelTier::Fast);
        assert_eq!(config.model_id, "mini");

        // Fast does not support tool selection
        let (tier, _) = router.route(TaskType::ToolSelection).unwrap();
        assert_eq!(tier, ModelTier::Standard);
    }

    #[test]
    fn quality_preference_picks_strongest() {
        let router = ModelRouter::new(three_tier(CostOptimization::Quality));
        let (tier, _) = router.route(TaskType::Conversation).unwrap();
        assert_eq!(tier, ModelTier::Strong);
    }

    #[test]
    fn balanced_prefers_standard_then_falls_back() {
        let router = ModelRouter::new(three_tier(CostOptimization::Balanced));
        let (tier, _) = router.route(TaskType::Conversation).unwrap();
        assert_eq!(tier, ModelTier::Standard);

        // Standard does not support evaluation; cheapest supporter wins
        let (tier, _) = router.route(TaskType::Evaluation).unwrap();
        assert_eq!(tier, ModelTier::Strong);
    }

    #[test]
    fn route_is_deterministic() {
        let router = ModelRouter::new(three_tier(CostOptimization::Cost));
        let first = router.route(TaskType::Conversation).unwrap().0;
        for _ in 0..10 {
            assert_eq!(router.route(TaskType::Conversation).unwrap().0, first);
        }
    }

    #[test]
    fn usage_accumulates_cost_by_tier() {
        let router = ModelRouter::new(three_tier(CostOptimization::Cost));
        router.record_usage(
            ModelTier::Strong,
            &Usage {
                prompt_tokens: 1000,
                completion_tokens: 1000,
                total_tokens: 2000,
            },
        );

        let stats = router.cost_stats();
        assert!((stats.total_cost - 0.04).abs() < 1e-9);
        assert_eq!(stats.by_tier[&ModelTier::Strong].input_tokens, 1000);
    }

    #[test]
    fn limit_callback_fires_exactly_once() {
        let mut config = three_tier(CostOptimization::Cost);
        config.daily_cost_limit = Some(0.05);

        let warnings = Arc::new(AtomicU32::new(0));
        let limits = Arc::new(AtomicU32::new(0));
        let w = warnings.clone();
        let l = limits.clone();

        let router = ModelRouter::new(config)
            .on_cost_warning(move |_| {
                w.fetch_add(1, Ordering::SeqCst);
            })
            .on_cost_limit_reached(move |_| {
                l.fetch_add(1, Ordering::SeqCst);
            });

        let usage = Usage {
            prompt_tokens: 1000,
            completion_tokens: 1000,
            total_tokens: 2000,
        };
        router.record_usage(ModelTier::Strong, &usage); // $0.04 -> warning
        router.record_usage(ModelTier::Strong, &usage); // $0.08 -> limit
        router.record_usage(ModelTier::Strong, &usage); // limit already fired

        assert_eq!(warnings.load(Ordering::SeqCst), 1);
        assert_eq!(limits.load(Ordering::SeqCst), 1);
    }
}
