//! Ring of recent tool outputs, kept in the prompt for situational
//! awareness. This is the first thing to shrink under pressure — the same
//! information usually survives in working memory via auto-spill.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::estimator::{self, ContentKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TrackedOutput {
    tool: String,
    content: String,
    tokens: u32,
}

#[derive(Serialize, Deserialize)]
struct TrackerState {
    outputs: Vec<TrackedOutput>,
}

pub struct ToolOutputTracker {
    ring: VecDeque<TrackedOutput>,
    max_outputs: usize,
    per_output_token_cap: u32,
}

impl ToolOutputTracker {
    pub fn new(max_outputs: usize, per_output_token_cap: u32) -> Self {
        Self {
            ring: VecDeque::new(),
            max_outputs: max_outputs.max(1),
            per_output_token_cap,
        }
    }

    pub fn record(&mut self, tool: &str, content: &str) {
        let tokens = estimator::estimate(content, ContentKind::Mixed);
        self.ring.push_back(TrackedOutput {
            tool: tool.to_string(),
            content: content.to_string(),
            tokens,
        });
        // The ring holds twice the advertised window; render() shows the
        // freshest half.
        while self.ring.len() > self.max_outputs * 2 {
            self.ring.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn estimated_tokens(&self) -> u32 {
        self.ring.iter().map(|o| o.tokens).sum()
    }

    /// The prompt block, or `None` when there is nothing to show.
    pub fn render(&self) -> Option<String> {
        if self.ring.is_empty() {
            return None;
        }
        let mut out = String::from("Recent tool outputs (newest last):\n");
        for o in &self.ring {
            out.push_str(&format!("[{}]\n{}\n", o.tool, o.content));
        }
        Some(out)
    }

    /// Shed tokens: halve the ring (oldest half goes), then truncate
    /// whatever still exceeds the per-output cap. Returns tokens freed.
    pub fn compact(&mut self) -> u32 {
        let before = self.estimated_tokens();

        let keep = self.ring.len().div_ceil(2);
        while self.ring.len() > keep {
            self.ring.pop_front();
        }

        for output in &mut self.ring {
            if output.tokens > self.per_output_token_cap {
                let keep_chars = (self.per_output_token_cap as usize) * 3;
                if output.content.len() > keep_chars {
                    let mut cut = keep_chars;
                    while !output.content.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    output.content.truncate(cut);
                    output.content.push_str("… [truncated]");
                }
                output.tokens = estimator::estimate(&output.content, ContentKind::Mixed);
            }
        }

        let freed = before.saturating_sub(self.estimated_tokens());
        debug!(freed, remaining = self.ring.len(), "tool output ring compacted");
        freed
    }

    pub fn state(&self) -> Value {
        serde_json::to_value(TrackerState {
            outputs: self.ring.iter().cloned().collect(),
        })
        .unwrap_or(Value::Null)
    }

    pub fn restore_state(&mut self, blob: &Value) {
        if let Ok(state) = serde_json::from_value::<TrackerState>(blob.clone()) {
            self.ring = state.outputs.into();
            while self.ring.len() > self.max_outputs * 2 {
                self.ring.pop_front();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_holds_twice_the_window() {
        let mut tracker = ToolOutputTracker::new(3, 1000);
        for i in 0..10 {
            tracker.record("echo", &format!("output {i}"));
        }
        assert_eq!(tracker.len(), 6);
        let rendered = tracker.render().unwrap();
        assert!(!rendered.contains("output 3"));
        assert!(rendered.contains("output 4"));
        assert!(rendered.contains("output 9"));
    }

    #[test]
    fn compact_halves_then_truncates() {
        let mut tracker = ToolOutputTracker::new(4, 10);
        for i in 0..8 {
            tracker.record("read_file", &format!("{i}-{}", "x".repeat(400)));
        }
        let before = tracker.estimated_tokens();
        let freed = tracker.compact();
        assert_eq!(tracker.len(), 4);
        assert!(freed > 0);
        assert_eq!(before - freed, tracker.estimated_tokens());
        // Survivors are cut down near the per-output cap.
        for rendered in tracker.render().unwrap().lines() {
            assert!(rendered.len() < 100);
        }
    }

    #[test]
    fn compact_on_empty_is_zero() {
        let mut tracker = ToolOutputTracker::new(4, 10);
        assert_eq!(tracker.compact(), 0);
        assert!(tracker.render().is_none());
    }

    #[test]
    fn state_roundtrip() {
        let mut tracker = ToolOutputTracker::new(4, 100);
        tracker.record("search", "hits");
        tracker.record("fetch", "body");

        let blob = tracker.state();
        let mut restored = ToolOutputTracker::new(4, 100);
        restored.restore_state(&blob);
        assert_eq!(restored.len(), 2);
        assert!(restored.render().unwrap().contains("body"));
    }
}
