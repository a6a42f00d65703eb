//! When to compact. A strategy is a predicate over the current budget;
//! only `adaptive` reads history, and that history lives in the manager.

use serde::{Deserialize, Serialize};

use crate::context::Budget;

/// Rolling observations the manager maintains for `adaptive`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactionStats {
    pub conversation_len: usize,
    pub avg_tokens_freed_per_turn: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum CompactionStrategy {
    /// Compact at 75% utilization.
    Proactive,
    /// Compact at 60% utilization.
    Aggressive,
    /// Compact only at 90% utilization.
    Lazy,
    /// Ignore the budget; compact whenever the conversation outgrows a
    /// fixed message count.
    RollingWindow { max_messages: usize },
    /// Proactive while recent compactions have been paying off (freeing at
    /// least `freed_per_turn_target` tokens per turn on average), otherwise
    /// aggressive.
    Adaptive { freed_per_turn_target: u32 },
}

impl Default for CompactionStrategy {
    fn default() -> Self {
        Self::Proactive
    }
}

impl CompactionStrategy {
    pub fn should_compact(&self, budget: &Budget, stats: &CompactionStats) -> bool {
        match self {
            Self::Proactive => budget.utilization() >= 0.75,
            Self::Aggressive => budget.utilization() >= 0.60,
            Self::Lazy => budget.utilization() >= 0.90,
            Self::RollingWindow { max_messages } => stats.conversation_len > *max_messages,
            Self::Adaptive {
                freed_per_turn_target,
            } => {
                let threshold =
                    if stats.avg_tokens_freed_per_turn >= *freed_per_turn_target as f32 {
                        0.75
                    } else {
                        0.60
                    };
                budget.utilization() >= threshold
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn budget_at(used: u32) -> Budget {
        let mut breakdown = BTreeMap::new();
        breakdown.insert("conversation_history".to_string(), used);
        Budget::compute(1000, 0.0, breakdown)
    }

    #[test]
    fn proactive_fires_at_75() {
        let strategy = CompactionStrategy::Proactive;
        let stats = CompactionStats::default();
        assert!(!strategy.should_compact(&budget_at(740), &stats));
        assert!(strategy.should_compact(&budget_at(750), &stats));
    }

    #[test]
    fn aggressive_fires_at_60() {
        let strategy = CompactionStrategy::Aggressive;
        let stats = CompactionStats::default();
        assert!(!strategy.should_compact(&budget_at(590), &stats));
        assert!(strategy.should_compact(&budget_at(600), &stats));
    }

    #[test]
    fn lazy_waits_for_90() {
        let strategy = CompactionStrategy::Lazy;
        let stats = CompactionStats::default();
        assert!(!strategy.should_compact(&budget_at(850), &stats));
        assert!(strategy.should_compact(&budget_at(900), &stats));
    }

    #[test]
    fn rolling_window_ignores_budget() {
        let strategy = CompactionStrategy::RollingWindow { max_messages: 10 };
        let short = CompactionStats {
            conversation_len: 5,
            ..Default::default()
        };
        let long = CompactionStats {
            conversation_len: 11,
            ..Default::default()
        };
        assert!(!strategy.should_compact(&budget_at(990), &short));
        assert!(strategy.should_compact(&budget_at(0), &long));
    }

    #[test]
    fn adaptive_tracks_payoff() {
        let strategy = CompactionStrategy::Adaptive {
            freed_per_turn_target: 500,
        };
        let paying_off = CompactionStats {
            avg_tokens_freed_per_turn: 800.0,
            ..Default::default()
        };
        let stalled = CompactionStats {
            avg_tokens_freed_per_turn: 100.0,
            ..Default::default()
        };
        // 65% utilization: proactive says no, aggressive says yes.
        let budget = budget_at(650);
        assert!(!strategy.should_compact(&budget, &paying_off));
        assert!(strategy.should_compact(&budget, &stalled));
    }

    #[test]
    fn strategy_serde_roundtrip() {
        let s = CompactionStrategy::RollingWindow { max_messages: 40 };
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["strategy"], "rolling_window");
        let back: CompactionStrategy = serde_json::from_value(v).unwrap();
        assert_eq!(back, s);
    }
}
