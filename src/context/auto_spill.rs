//! Auto-spill: oversized tool outputs are moved into working memory under
//! `raw.autospill_*` keys instead of bloating the conversation. A spill
//! record tracks each one until the model distills it and cleanup reclaims
//! the raw bytes.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::memory::{MemoryError, Priority, SetOptions, Tier, WorkingMemory};

#[derive(Debug, Clone)]
pub struct AutoSpillConfig {
    /// Outputs at or above this size are spilled.
    pub threshold_bytes: usize,
    /// Exact tool-name allow-list.
    pub tools: Vec<String>,
    /// Tool-name patterns, checked after the allow-list. An empty config
    /// (no tools, no patterns) spills every tool over the threshold.
    pub patterns: Vec<Regex>,
}

impl Default for AutoSpillConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: 5 * 1024,
            tools: vec![
                "web_fetch".to_string(),
                "web_search".to_string(),
                "read_file".to_string(),
            ],
            patterns: Vec::new(),
        }
    }
}

impl AutoSpillConfig {
    fn matches(&self, tool: &str) -> bool {
        if self.tools.is_empty() && self.patterns.is_empty() {
            return true;
        }
        self.tools.iter().any(|t| t == tool)
            || self.patterns.iter().any(|p| p.is_match(tool))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpillRecord {
    pub memory_key: String,
    pub source_tool: String,
    pub description: String,
    pub tool_args: Value,
    pub size_bytes: usize,
    pub timestamp: DateTime<Utc>,
    pub consumed: bool,
    #[serde(default)]
    pub derived_summaries: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub records_removed: usize,
    pub keys_deleted: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct SpillState {
    records: Vec<SpillRecord>,
    seq: u64,
}

pub struct AutoSpill {
    config: AutoSpillConfig,
    records: Vec<SpillRecord>,
    seq: u64,
}

impl AutoSpill {
    pub fn new(config: AutoSpillConfig) -> Self {
        Self {
            config,
            records: Vec::new(),
            seq: 0,
        }
    }

    pub fn records(&self) -> &[SpillRecord] {
        &self.records
    }

    pub fn record_for(&self, memory_key: &str) -> Option<&SpillRecord> {
        self.records.iter().find(|r| r.memory_key == memory_key)
    }

    /// Intercept a tool output. Returns the memory key when the output was
    /// spilled, `None` when it rode through untouched.
    pub fn on_tool_output(
        &mut self,
        memory: &mut WorkingMemory,
        tool: &str,
        output: &str,
        args: &Value,
        describe_call: Option<&str>,
    ) -> Result<Option<String>, MemoryError> {
        if output.len() < self.config.threshold_bytes || !self.config.matches(tool) {
            return Ok(None);
        }

        let description = describe_call
            .map(str::to_string)
            .or_else(|| describe_tool_call(tool, args))
            .unwrap_or_else(|| format!("output of {tool}"));

        self.seq += 1;
        let key = format!(
            "raw.autospill_{tool}_{}_{}",
            slug(&description),
            self.seq
        );

        memory.set(
            key.clone(),
            format!("Unprocessed {tool} output: {description}"),
            json!(output),
            SetOptions::priority(Priority::Low),
        )?;

        info!(tool, key = %key, size = output.len(), "tool output spilled to memory");
        self.records.push(SpillRecord {
            memory_key: key.clone(),
            source_tool: tool.to_string(),
            description,
            tool_args: args.clone(),
            size_bytes: output.len(),
            timestamp: Utc::now(),
            consumed: false,
            derived_summaries: Vec::new(),
        });

        Ok(Some(key))
    }

    /// Mark a spilled output processed: store the summary, link the
    /// derivation, flag the record consumed. Tool-facing, so errors are
    /// plain strings.
    pub fn process(
        &mut self,
        memory: &mut WorkingMemory,
        memory_key: &str,
        summary: &str,
        summary_key: Option<String>,
    ) -> Result<String, String> {
        let record = self
            .records
            .iter_mut()
            .find(|r| r.memory_key == memory_key)
            .ok_or_else(|| format!("no spill record for key: {memory_key}"))?;

        let summary_key =
            summary_key.unwrap_or_else(|| format!("findings.autospill_{}", record.memory_key
                .rsplit('_')
                .next()
                .unwrap_or("0")));

        memory
            .set(
                summary_key.clone(),
                format!("Summary of {}", record.description),
                json!(summary),
                SetOptions::default(),
            )
            .map_err(|e| e.to_string())?;
        memory.set_derived_from(&summary_key, vec![memory_key.to_string()]);

        record.consumed = true;
        if !record.derived_summaries.contains(&summary_key) {
            record.derived_summaries.push(summary_key.clone());
        }
        debug!(key = memory_key, summary_key = %summary_key, "spill processed");
        Ok(summary_key)
    }

    /// Reclaim raw bytes for consumed records whose summaries all survive
    /// in memory. The raw entry is only deleted while it still sits in the
    /// raw tier — the agent may have reclassified it.
    pub fn cleanup(&mut self, memory: &mut WorkingMemory) -> CleanupReport {
        let mut report = CleanupReport::default();
        self.records.retain(|record| {
            let done = record.consumed
                && !record.derived_summaries.is_empty()
                && record.derived_summaries.iter().all(|k| memory.has(k));
            if !done {
                return true;
            }
            if memory.has(&record.memory_key) && Tier::of(&record.memory_key) == Tier::Raw {
                memory.delete(&record.memory_key);
                report.keys_deleted.push(record.memory_key.clone());
            }
            report.records_removed += 1;
            false
        });
        if report.records_removed > 0 {
            info!(
                removed = report.records_removed,
                deleted = report.keys_deleted.len(),
                "spill cleanup"
            );
        }
        report
    }

    /// The prompt block enumerating unconsumed spills, or `None`.
    pub fn render_pending(&self) -> Option<String> {
        let pending: Vec<&SpillRecord> = self.records.iter().filter(|r| !r.consumed).collect();
        if pending.is_empty() {
            return None;
        }
        let mut out = String::from(
            "Large tool outputs were saved to working memory and await processing. \
             Read each key and distill it with autospill_process(key, summary, summary_key?):\n",
        );
        for r in pending {
            out.push_str(&format!(
                "- {} — {} ({} bytes, from {})\n",
                r.memory_key, r.description, r.size_bytes, r.source_tool
            ));
        }
        Some(out)
    }

    pub fn state(&self) -> Value {
        serde_json::to_value(SpillState {
            records: self.records.clone(),
            seq: self.seq,
        })
        .unwrap_or(Value::Null)
    }

    pub fn restore_state(&mut self, blob: &Value) {
        if let Ok(state) = serde_json::from_value::<SpillState>(blob.clone()) {
            self.records = state.records;
            self.seq = state.seq;
        }
    }
}

/// Tool-specific one-liners for spill descriptions.
fn describe_tool_call(tool: &str, args: &Value) -> Option<String> {
    match tool {
        "web_fetch" => {
            let url = args.get("url")?.as_str()?;
            let stripped = url
                .strip_prefix("https://")
                .or_else(|| url.strip_prefix("http://"))
                .unwrap_or(url);
            let without_query = stripped.split('?').next().unwrap_or(stripped);
            Some(without_query.trim_end_matches('/').to_string())
        }
        "web_search" => {
            let query = args.get("query")?.as_str()?;
            Some(format!("\"{query}\""))
        }
        "read_file" => {
            let path = args.get("path")?.as_str()?;
            Some(
                path.rsplit('/')
                    .next()
                    .unwrap_or(path)
                    .to_string(),
            )
        }
        _ => None,
    }
}

fn slug(text: &str) -> String {
    let mut slug: String = text
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    while slug.contains("__") {
        slug = slug.replace("__", "_");
    }
    let slug = slug.trim_matches('_');
    slug.chars().take(24).collect()
}
