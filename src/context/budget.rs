//! Token accounting. A `Budget` is a snapshot: per-component usage, the
//! response reserve, and a status classification the compaction loop keys
//! off.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStatus {
    Ok,
    Warning,
    Critical,
}

pub const WARNING_THRESHOLD: f32 = 0.75;
pub const CRITICAL_THRESHOLD: f32 = 0.90;

#[derive(Debug, Clone)]
pub struct Budget {
    pub total: u32,
    /// Tokens held back for the model's response.
    pub reserved: u32,
    pub used: u32,
    pub available: u32,
    pub utilization_percent: f32,
    pub status: BudgetStatus,
    /// Per-component token estimates, keyed by component name.
    pub breakdown: BTreeMap<String, u32>,
}

impl Budget {
    /// Derive a budget from a component breakdown. `response_reserve` is a
    /// fraction of `total`.
    pub fn compute(total: u32, response_reserve: f32, breakdown: BTreeMap<String, u32>) -> Self {
        let reserved = (total as f64 * response_reserve as f64).round() as u32;
        let used: u32 = breakdown.values().sum();
        let available = total.saturating_sub(used).saturating_sub(reserved);
        let utilization = if total == 0 {
            1.0
        } else {
            (used + reserved) as f32 / total as f32
        };
        let status = if utilization >= CRITICAL_THRESHOLD {
            BudgetStatus::Critical
        } else if utilization >= WARNING_THRESHOLD {
            BudgetStatus::Warning
        } else {
            BudgetStatus::Ok
        };

        Self {
            total,
            reserved,
            used,
            available,
            utilization_percent: utilization * 100.0,
            status,
            breakdown,
        }
    }

    /// Utilization as a fraction of the total window.
    pub fn utilization(&self) -> f32 {
        self.utilization_percent / 100.0
    }

    pub fn component(&self, name: &str) -> u32 {
        self.breakdown.get(name).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breakdown(pairs: &[(&str, u32)]) -> BTreeMap<String, u32> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[test]
    fn derivation_matches_the_arithmetic() {
        let b = Budget::compute(
            1000,
            0.15,
            breakdown(&[("conversation_history", 700), ("system_prompt", 100)]),
        );
        assert_eq!(b.used, 800);
        assert_eq!(b.reserved, 150);
        assert_eq!(b.available, 50);
        assert_eq!(b.status, BudgetStatus::Critical);
        assert!((b.utilization() - 0.95).abs() < 1e-6);
    }

    #[test]
    fn status_classification_boundaries() {
        // ok < 75% <= warning < 90% <= critical
        let ok = Budget::compute(1000, 0.0, breakdown(&[("c", 749)]));
        assert_eq!(ok.status, BudgetStatus::Ok);

        let warning = Budget::compute(1000, 0.0, breakdown(&[("c", 750)]));
        assert_eq!(warning.status, BudgetStatus::Warning);

        let still_warning = Budget::compute(1000, 0.0, breakdown(&[("c", 899)]));
        assert_eq!(still_warning.status, BudgetStatus::Warning);

        let critical = Budget::compute(1000, 0.0, breakdown(&[("c", 900)]));
        assert_eq!(critical.status, BudgetStatus::Critical);
    }

    #[test]
    fn reserve_counts_toward_utilization() {
        // 700 used + 150 reserved = 85% -> warning even though usage alone
        // is only 70%.
        let b = Budget::compute(1000, 0.15, breakdown(&[("c", 700)]));
        assert_eq!(b.status, BudgetStatus::Warning);
    }

    #[test]
    fn zero_total_is_saturated() {
        let b = Budget::compute(0, 0.5, breakdown(&[("c", 10)]));
        assert_eq!(b.status, BudgetStatus::Critical);
        assert_eq!(b.available, 0);
    }

    #[test]
    fn component_lookup() {
        let b = Budget::compute(1000, 0.0, breakdown(&[("memory_index", 42)]));
        assert_eq!(b.component("memory_index"), 42);
        assert_eq!(b.component("absent"), 0);
    }
}
