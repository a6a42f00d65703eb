//! Tracks tool_use/tool_result pairs so old results can be moved out of
//! the conversation and into working memory at iteration boundaries. The
//! manager owns the actual pair removal; this module only decides *what*
//! is old enough to go and keeps its message indices in sync.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::estimator::{self, ContentKind};

#[derive(Debug, Clone)]
pub struct EvictionConfig {
    /// A result this many iterations old becomes eligible.
    pub min_iterations_age: u32,
    /// Tracked content beyond this many bytes forces eviction of the
    /// oldest results even before they age out.
    pub max_tracked_bytes: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            min_iterations_age: 3,
            max_tracked_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedResult {
    pub tool_use_id: String,
    pub tool_name: String,
    pub content: String,
    pub message_index: usize,
    pub iterations_observed: u32,
    pub estimated_tokens: u32,
}

#[derive(Serialize, Deserialize)]
struct EvictionState {
    tracked: Vec<TrackedResult>,
}

/// Outcome summary the manager assembles after an eviction pass.
#[derive(Debug, Clone, Default)]
pub struct EvictionReport {
    pub evicted: usize,
    pub tokens_freed: u32,
    pub memory_keys: Vec<String>,
    pub log: Vec<String>,
}

pub struct ToolResultEviction {
    tracked: Vec<TrackedResult>,
    config: EvictionConfig,
}

impl ToolResultEviction {
    pub fn new(config: EvictionConfig) -> Self {
        Self {
            tracked: Vec::new(),
            config,
        }
    }

    pub fn tracked(&self) -> &[TrackedResult] {
        &self.tracked
    }

    /// Register a freshly ingested tool result.
    pub fn on_tool_result(
        &mut self,
        tool_use_id: &str,
        tool_name: &str,
        content: &str,
        message_index: usize,
    ) {
        self.tracked.push(TrackedResult {
            tool_use_id: tool_use_id.to_string(),
            tool_name: tool_name.to_string(),
            content: content.to_string(),
            message_index,
            iterations_observed: 0,
            estimated_tokens: estimator::estimate(content, ContentKind::Mixed),
        });
    }

    /// A new iteration began; everything tracked is now one older.
    pub fn on_iteration(&mut self) {
        for record in &mut self.tracked {
            record.iterations_observed += 1;
        }
    }

    pub fn total_tracked_bytes(&self) -> usize {
        self.tracked.iter().map(|r| r.content.len()).sum()
    }

    pub fn should_evict(&self) -> bool {
        self.tracked
            .iter()
            .any(|r| r.iterations_observed >= self.config.min_iterations_age)
            || self.total_tracked_bytes() > self.config.max_tracked_bytes
    }

    /// Ids eligible for eviction: everything aged past the minimum, plus —
    /// when the byte ceiling is breached — the oldest younger results
    /// until the remainder fits.
    pub fn eligible_ids(&self) -> Vec<String> {
        let mut eligible: Vec<&TrackedResult> = self
            .tracked
            .iter()
            .filter(|r| r.iterations_observed >= self.config.min_iterations_age)
            .collect();

        let mut remaining_bytes: usize = self
            .tracked
            .iter()
            .filter(|r| r.iterations_observed < self.config.min_iterations_age)
            .map(|r| r.content.len())
            .sum();

        if remaining_bytes > self.config.max_tracked_bytes {
            let mut young: Vec<&TrackedResult> = self
                .tracked
                .iter()
                .filter(|r| r.iterations_observed < self.config.min_iterations_age)
                .collect();
            // Oldest (most iterations, lowest index) first.
            young.sort_by(|a, b| {
                b.iterations_observed
                    .cmp(&a.iterations_observed)
                    .then(a.message_index.cmp(&b.message_index))
            });
            for record in young {
                if remaining_bytes <= self.config.max_tracked_bytes {
                    break;
                }
                remaining_bytes -= record.content.len();
                eligible.push(record);
            }
        }

        eligible.sort_by_key(|r| r.message_index);
        eligible.iter().map(|r| r.tool_use_id.clone()).collect()
    }

    /// Remove a record from tracking, handing it to the manager for the
    /// memory write + pair removal.
    pub fn take(&mut self, tool_use_id: &str) -> Option<TrackedResult> {
        let pos = self
            .tracked
            .iter()
            .position(|r| r.tool_use_id == tool_use_id)?;
        Some(self.tracked.remove(pos))
    }

    /// Put a record back after a failed eviction attempt (e.g. the memory
    /// write was rejected at the hard cap).
    pub fn restore_record(&mut self, record: TrackedResult) {
        self.tracked.push(record);
    }

    /// The memory key an evicted result lands under.
    pub fn memory_key(record: &TrackedResult) -> String {
        format!("tool_results.{}_{}", record.tool_name, record.tool_use_id)
    }

    pub fn memory_description(record: &TrackedResult) -> String {
        format!(
            "evicted result of {} (call id {})",
            record.tool_name, record.tool_use_id
        )
    }

    /// Callback after *any* conversation removal: records whose messages
    /// vanished are dropped, survivors shift left by the number of removed
    /// indices preceding them.
    pub fn update_message_indices(&mut self, removed: &BTreeSet<usize>) {
        if removed.is_empty() {
            return;
        }
        self.tracked.retain(|r| !removed.contains(&r.message_index));
        for record in &mut self.tracked {
            let shift = removed.iter().filter(|&&i| i < record.message_index).count();
            record.message_index -= shift;
        }
    }

    pub fn state(&self) -> Value {
        serde_json::to_value(EvictionState {
            tracked: self.tracked.clone(),
        })
        .unwrap_or(Value::Null)
    }

    pub fn restore_state(&mut self, blob: &Value) {
        if let Ok(state) = serde_json::from_value::<EvictionState>(blob.clone()) {
            self.tracked = state.tracked;
        }
    }
}
