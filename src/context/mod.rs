//! The context manager: owns the conversation, the working-memory handle,
//! and every feature that contributes to or shrinks the prompt. `prepare`
//! is the heart — it runs once per iteration and carries the invariants.

pub mod auto_spill;
pub mod budget;
pub mod compact;
pub mod plugin;
pub mod profile;
pub mod result_eviction;
pub mod tool_outputs;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::conversation::{ContentPart, Conversation, Message, MessageMeta};
use crate::error::AgentError;
use crate::estimator::{self, ContentKind};
use crate::events::AgentEvent;
use crate::memory::{SetOptions, WorkingMemory};
use crate::session::{upgrade_state, SessionStore};
use crate::strategy::{CompactionStrategy, CompactionStats};

pub use auto_spill::{AutoSpill, AutoSpillConfig, CleanupReport, SpillRecord};
pub use budget::{Budget, BudgetStatus};
pub use compact::CompactionOutcome;
pub use plugin::{Component, ContextPlugin, PluginError, PluginHost};
pub use profile::{detect_task_type, PriorityProfile, TaskType};
pub use result_eviction::{EvictionConfig, EvictionReport, ToolResultEviction, TrackedResult};
pub use tool_outputs::ToolOutputTracker;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Feature switches. Memory-backed features require memory; the pairing is
/// validated at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Features {
    pub memory: bool,
    pub in_context_memory: bool,
    pub history: bool,
    pub permissions: bool,
    pub persistent_instructions: bool,
    pub tool_output_tracking: bool,
    pub auto_spill: bool,
    pub tool_result_eviction: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            memory: true,
            in_context_memory: true,
            history: true,
            permissions: true,
            persistent_instructions: true,
            tool_output_tracking: true,
            auto_spill: true,
            tool_result_eviction: true,
        }
    }
}

impl Features {
    pub fn validate(&self) -> Result<(), AgentError> {
        if !self.memory {
            if self.auto_spill {
                return Err(AgentError::Configuration(
                    "auto_spill requires the memory feature".into(),
                ));
            }
            if self.tool_result_eviction {
                return Err(AgentError::Configuration(
                    "tool_result_eviction requires the memory feature".into(),
                ));
            }
            if self.in_context_memory {
                return Err(AgentError::Configuration(
                    "in_context_memory requires the memory feature".into(),
                ));
            }
        }
        Ok(())
    }

    /// Everything off except the conversation itself.
    pub fn minimal() -> Self {
        Self {
            memory: false,
            in_context_memory: false,
            history: true,
            permissions: false,
            persistent_instructions: false,
            tool_output_tracking: false,
            auto_spill: false,
            tool_result_eviction: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub system_prompt: String,
    pub instructions: Option<String>,
    pub max_context_tokens: u32,
    /// Fraction of the window held back for the model's response.
    pub response_reserve: f32,
    pub strategy: CompactionStrategy,
    pub features: Features,
    pub auto_compact: bool,
    pub task_type: Option<TaskType>,
    pub auto_spill: AutoSpillConfig,
    pub eviction: EvictionConfig,
    pub max_recent_outputs: usize,
    pub per_output_token_cap: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            instructions: None,
            max_context_tokens: 200_000,
            response_reserve: 0.15,
            strategy: CompactionStrategy::default(),
            features: Features::default(),
            auto_compact: true,
            task_type: None,
            auto_spill: AutoSpillConfig::default(),
            eviction: EvictionConfig::default(),
            max_recent_outputs: 5,
            per_output_token_cap: 500,
        }
    }
}

/// One tool result flowing back into the context.
#[derive(Debug, Clone)]
pub struct ToolResultItem {
    pub tool_use_id: String,
    pub tool_name: String,
    pub content: String,
    pub error: Option<String>,
    pub tool_args: Value,
    pub describe_call: Option<String>,
    /// Tools that declare small output are exempt from auto-spill even
    /// when one result happens to run long.
    pub expected_small: bool,
}

impl ToolResultItem {
    pub fn ok(id: impl Into<String>, tool: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_use_id: id.into(),
            tool_name: tool.into(),
            content: content.into(),
            error: None,
            tool_args: Value::Null,
            describe_call: None,
            expected_small: false,
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.tool_args = args;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrepareFormat {
    #[default]
    LlmInput,
    Components,
}

#[derive(Debug, Clone, Default)]
pub struct PrepareOptions {
    pub instruction_override: Option<String>,
    pub format: PrepareFormat,
}

#[derive(Debug, Clone)]
pub enum PreparedOutput {
    Components(Vec<Component>),
    LlmInput {
        system: String,
        messages: Vec<Message>,
    },
}

#[derive(Debug, Clone)]
pub struct Prepared {
    pub budget: Budget,
    pub output: PreparedOutput,
}

pub struct ContextManager {
    system_prompt: String,
    instructions: Option<String>,
    features: Features,
    conversation: Conversation,
    memory: Option<Arc<Mutex<WorkingMemory>>>,
    auto_spill: Option<Arc<Mutex<AutoSpill>>>,
    result_eviction: Option<ToolResultEviction>,
    tracker: Option<ToolOutputTracker>,
    plugins: PluginHost,
    strategy: CompactionStrategy,
    profile: PriorityProfile,
    max_context_tokens: u32,
    response_reserve: f32,
    auto_compact: bool,
    /// Tokens freed by the last few compaction passes, for `adaptive`.
    freed_history: VecDeque<u32>,
    iteration: u64,
    events: Option<UnboundedSender<AgentEvent>>,
}

impl std::fmt::Debug for ContextManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextManager")
            .field("max_context_tokens", &self.max_context_tokens)
            .field("response_reserve", &self.response_reserve)
            .field("auto_compact", &self.auto_compact)
            .field("iteration", &self.iteration)
            .finish_non_exhaustive()
    }
}

impl ContextManager {
    pub fn new(config: ContextConfig) -> Result<Self, AgentError> {
        config.features.validate()?;

        let memory = config
            .features
            .memory
            .then(|| Arc::new(Mutex::new(WorkingMemory::new())));
        let auto_spill = config
            .features
            .auto_spill
            .then(|| Arc::new(Mutex::new(AutoSpill::new(config.auto_spill.clone()))));
        let result_eviction = config
            .features
            .tool_result_eviction
            .then(|| ToolResultEviction::new(config.eviction.clone()));
        let tracker = config.features.tool_output_tracking.then(|| {
            ToolOutputTracker::new(config.max_recent_outputs, config.per_output_token_cap)
        });
        let profile = PriorityProfile::for_task_type(config.task_type.unwrap_or_default());

        Ok(Self {
            system_prompt: config.system_prompt,
            instructions: config.instructions,
            features: config.features,
            conversation: Conversation::new(),
            memory,
            auto_spill,
            result_eviction,
            tracker,
            plugins: PluginHost::new(),
            strategy: config.strategy,
            profile,
            max_context_tokens: config.max_context_tokens,
            response_reserve: config.response_reserve,
            auto_compact: config.auto_compact,
            freed_history: VecDeque::new(),
            iteration: 0,
            events: None,
        })
    }

    pub fn with_events(mut self, events: UnboundedSender<AgentEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn set_events(&mut self, events: UnboundedSender<AgentEvent>) {
        self.events = Some(events);
    }

    /// Replace the backing store, keeping the feature wiring. Used by
    /// restore and by tests that need custom caps.
    pub fn with_working_memory(self, memory: WorkingMemory) -> Self {
        if let Some(handle) = &self.memory {
            *lock(handle) = memory;
        }
        self
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    // -- accessors ------------------------------------------------------

    pub fn features(&self) -> Features {
        self.features
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn task_type(&self) -> TaskType {
        self.profile.task_type
    }

    /// Switch the priority profile, e.g. after a plan is approved.
    pub fn set_task_type(&mut self, task_type: TaskType) {
        if self.profile.task_type != task_type {
            info!(?task_type, "priority profile switched");
            self.profile = PriorityProfile::for_task_type(task_type);
        }
    }

    /// `None` when the memory feature is disabled.
    pub fn memory_handle(&self) -> Option<Arc<Mutex<WorkingMemory>>> {
        self.memory.clone()
    }

    /// The throwing accessor for callers that cannot work without memory.
    pub fn require_memory(&self) -> Result<Arc<Mutex<WorkingMemory>>, AgentError> {
        self.memory.clone().ok_or_else(|| {
            AgentError::Configuration("memory feature is disabled".into())
        })
    }

    pub fn auto_spill_handle(&self) -> Option<Arc<Mutex<AutoSpill>>> {
        self.auto_spill.clone()
    }

    pub fn register_plugin(&mut self, plugin: Box<dyn ContextPlugin>) -> Result<(), AgentError> {
        self.plugins.register(plugin)
    }

    // -- message ingestion ---------------------------------------------

    pub fn add_user_message(&mut self, content: &str) -> Option<String> {
        self.push_message(Message::user_text(content))
    }

    pub fn add_input_items(&mut self, items: Vec<Message>) -> Vec<String> {
        items
            .into_iter()
            .filter_map(|m| self.push_message(m))
            .collect()
    }

    pub fn add_assistant_response(&mut self, parts: Vec<ContentPart>) -> Option<String> {
        self.push_message(Message::assistant(parts))
    }

    /// Ingest tool results: spill oversized outputs to memory, record the
    /// ring entry, append the tool_result message, and register each pair
    /// for future eviction.
    pub fn add_tool_results(
        &mut self,
        results: Vec<ToolResultItem>,
    ) -> Result<Option<String>, AgentError> {
        if !self.features.history || results.is_empty() {
            return Ok(None);
        }

        let mut parts = Vec::with_capacity(results.len());
        let mut ingested: Vec<(String, String, String)> = Vec::new(); // (id, tool, content as stored)

        for item in results {
            let mut content = item.content;
            if item.error.is_none() && !item.expected_small {
                if let (Some(spill), Some(memory)) = (&self.auto_spill, &self.memory) {
                    let spilled = lock(spill).on_tool_output(
                        &mut lock(memory),
                        &item.tool_name,
                        &content,
                        &item.tool_args,
                        item.describe_call.as_deref(),
                    )?;
                    if let Some(key) = spilled {
                        content = format!(
                            "[{} bytes saved to working memory under {key}; read it from \
                             there and distill with autospill_process]",
                            content.len()
                        );
                    }
                }
            }

            if let Some(tracker) = &mut self.tracker {
                tracker.record(&item.tool_name, &content);
            }

            ingested.push((item.tool_use_id.clone(), item.tool_name.clone(), content.clone()));
            parts.push(ContentPart::ToolResult {
                tool_use_id: item.tool_use_id,
                content,
                error: item.error,
            });
        }

        let id = self.push_message(Message::tool_results(parts));
        if id.is_some() {
            let message_index = self.conversation.len() - 1;
            if let Some(eviction) = &mut self.result_eviction {
                for (tool_use_id, tool_name, content) in &ingested {
                    eviction.on_tool_result(tool_use_id, tool_name, content, message_index);
                }
            }
        }
        Ok(id)
    }

    fn push_message(&mut self, message: Message) -> Option<String> {
        if !self.features.history {
            return None;
        }
        let id = self.conversation.push(message);
        self.emit(AgentEvent::MessageAdded { id: id.clone() });
        Some(id)
    }

    pub fn protect_from_compaction(&mut self) {
        self.conversation.protect_tail();
    }

    /// Atomic pair removal, with index-tracker notification. Returns the
    /// tokens freed.
    pub fn remove_tool_pair(&mut self, tool_use_id: &str) -> Result<u32, AgentError> {
        let removal = self.conversation.remove_tool_pair(tool_use_id)?;
        if let Some(eviction) = &mut self.result_eviction {
            let removed: BTreeSet<usize> = removal.removed_messages.iter().copied().collect();
            eviction.update_message_indices(&removed);
        }
        Ok(removal.tokens_freed)
    }

    // -- prepare --------------------------------------------------------

    /// The central operation. Runs once per iteration: protects the tail,
    /// ages and possibly evicts tool results, builds components, computes
    /// the budget, compacts if the strategy says so, and assembles the
    /// model input.
    pub fn prepare(&mut self, opts: PrepareOptions) -> Result<Prepared, AgentError> {
        self.protect_from_compaction();
        self.iteration += 1;

        if let Some(memory) = &self.memory {
            let expired = lock(memory).clear_turn_scope();
            if expired > 0 {
                debug!(expired, "turn-scoped memory entries cleared");
            }
        }

        let eviction_due = match &mut self.result_eviction {
            Some(eviction) => {
                eviction.on_iteration();
                eviction.should_evict()
            }
            None => false,
        };
        if eviction_due {
            let report = self.evict_old_results()?;
            if report.evicted > 0 {
                info!(
                    evicted = report.evicted,
                    tokens_freed = report.tokens_freed,
                    "tool results evicted at iteration boundary"
                );
            }
        }

        let mut components = self.build_components(opts.instruction_override.as_deref());
        let mut budget = self.compute_budget(&components);

        match budget.status {
            BudgetStatus::Warning => self.emit(AgentEvent::BudgetWarning {
                utilization_percent: budget.utilization_percent,
            }),
            BudgetStatus::Critical => self.emit(AgentEvent::BudgetCritical {
                utilization_percent: budget.utilization_percent,
            }),
            BudgetStatus::Ok => {}
        }

        let stats = self.compaction_stats();
        if self.auto_compact && self.strategy.should_compact(&budget, &stats) {
            let freed = self.run_compaction_pass(&components, &budget)?;
            self.freed_history.push_back(freed);
            while self.freed_history.len() > 8 {
                self.freed_history.pop_front();
            }
            components = self.build_components(opts.instruction_override.as_deref());
            budget = self.compute_budget(&components);
        }

        let output = match opts.format {
            PrepareFormat::Components => PreparedOutput::Components(components),
            PrepareFormat::LlmInput => {
                let system = components
                    .iter()
                    .filter(|c| c.name != "conversation_history" && c.name != "current_input")
                    .map(|c| c.content.as_str())
                    .filter(|c| !c.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n\n");
                PreparedOutput::LlmInput {
                    system,
                    messages: self.conversation.messages().to_vec(),
                }
            }
        };

        Ok(Prepared { budget, output })
    }

    /// Pre-admission guard: will `estimated_tokens` more fit? May compact
    /// to make room.
    pub fn ensure_capacity(&mut self, estimated_tokens: u32) -> Result<bool, AgentError> {
        let components = self.build_components(None);
        let budget = self.compute_budget(&components);
        if budget.available >= estimated_tokens {
            return Ok(true);
        }
        if self.auto_compact {
            self.run_compaction_pass(&components, &budget)?;
            let components = self.build_components(None);
            let budget = self.compute_budget(&components);
            return Ok(budget.available >= estimated_tokens);
        }
        Ok(false)
    }

    fn compaction_stats(&self) -> CompactionStats {
        let avg = if self.freed_history.is_empty() {
            0.0
        } else {
            self.freed_history.iter().sum::<u32>() as f32 / self.freed_history.len() as f32
        };
        CompactionStats {
            conversation_len: self.conversation.len(),
            avg_tokens_freed_per_turn: avg,
        }
    }

    /// Deterministic component order: system prompt, instructions, feature
    /// instructions, conversation history, memory index, feature/plugin
    /// components, current input.
    fn build_components(&mut self, instruction_override: Option<&str>) -> Vec<Component> {
        let mut components = Vec::new();

        components.push(Component::pinned("system_prompt", self.system_prompt.clone()));

        let instructions = instruction_override
            .map(str::to_string)
            .or_else(|| {
                self.features
                    .persistent_instructions
                    .then(|| self.instructions.clone())
                    .flatten()
            })
            .unwrap_or_default();
        if !instructions.is_empty() {
            components.push(Component::pinned("instructions", instructions));
        }

        let preamble = self.profile.preamble(self.features.memory);
        if !preamble.is_empty() {
            components.push(Component::pinned("feature_instructions", preamble));
        }

        let boundary = self.conversation.protected_from_index();
        components.push(Component::new(
            "conversation_history",
            render_transcript(&self.conversation, 0, boundary),
            self.profile.priority_of("conversation_history"),
        ));

        if self.features.in_context_memory {
            if let Some(memory) = &self.memory {
                let index = lock(memory).render_index();
                if !index.is_empty() {
                    components.push(Component::new(
                        "memory_index",
                        index,
                        self.profile.priority_of("memory_index"),
                    ));
                }
            }
        }

        if let Some(tracker) = &self.tracker {
            if let Some(rendered) = tracker.render() {
                components.push(Component::new(
                    "recent_tool_outputs",
                    rendered,
                    self.profile.priority_of("recent_tool_outputs"),
                ));
            }
        }

        if let Some(spill) = &self.auto_spill {
            if let Some(pending) = lock(spill).render_pending() {
                // Low priority: the listing is small and the model still
                // needs it to know the keys exist.
                components.push(Component::new("pending_spills", pending, 1));
            }
        }

        components.extend(self.plugins.components());

        components.push(Component::pinned(
            "current_input",
            render_transcript(&self.conversation, boundary, self.conversation.len()),
        ));

        components
    }

    fn compute_budget(&self, components: &[Component]) -> Budget {
        let boundary = self.conversation.protected_from_index();
        let mut breakdown = BTreeMap::new();
        for c in components {
            let tokens = match c.name.as_str() {
                // Conversation components are estimated from per-message
                // metadata, not the rendered text.
                "conversation_history" => self.conversation.tokens_in_range(0, boundary),
                "current_input" => self
                    .conversation
                    .tokens_in_range(boundary, self.conversation.len()),
                _ => estimator::estimate(&c.content, ContentKind::Mixed),
            };
            breakdown.insert(c.name.clone(), tokens);
        }
        Budget::compute(self.max_context_tokens, self.response_reserve, breakdown)
    }

    /// One compaction pass: compactable components in priority order
    /// (highest first), each reduced in turn until the budget is ok again.
    fn run_compaction_pass(
        &mut self,
        components: &[Component],
        budget: &Budget,
    ) -> Result<u32, AgentError> {
        let mut order: Vec<(String, u32)> = components
            .iter()
            .filter(|c| c.compactable && c.priority > 0)
            .map(|c| (c.name.clone(), c.priority))
            .collect();
        order.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let deficit = budget
            .used
            .saturating_sub((budget.total as f64 * 0.5) as u32)
            .max(1);
        let mut total_freed = 0u32;

        for (name, _) in order {
            let freed = match name.as_str() {
                "conversation_history" => {
                    let outcome = compact::compact_conversation(&mut self.conversation);
                    if let Some(eviction) = &mut self.result_eviction {
                        eviction.update_message_indices(&outcome.removed_indices);
                    }
                    if outcome.removed > 0 {
                        self.emit(AgentEvent::HistoryCompacted {
                            removed: outcome.removed,
                            tokens_freed: outcome.tokens_freed,
                        });
                    }
                    outcome.tokens_freed
                }
                "memory_index" => self.evict_memory_batch(),
                "recent_tool_outputs" => {
                    self.tracker.as_mut().map(|t| t.compact()).unwrap_or(0)
                }
                "pending_spills" => self.cleanup_spills(),
                other => self.plugins.compact_plugin(other, deficit),
            };
            total_freed += freed;

            let components = self.build_components(None);
            let budget = self.compute_budget(&components);
            if budget.status == BudgetStatus::Ok {
                break;
            }
        }

        debug!(tokens_freed = total_freed, "compaction pass finished");
        Ok(total_freed)
    }

    fn evict_memory_batch(&mut self) -> u32 {
        let Some(memory) = &self.memory else { return 0 };
        let mut memory = lock(memory);
        let before = memory.total_bytes();
        let evicted = memory.evict(4, crate::memory::EvictionPolicy::Lru);
        if evicted.is_empty() {
            return 0;
        }
        let freed_bytes = before - memory.total_bytes();
        estimator::estimate_bytes(freed_bytes, ContentKind::Mixed)
    }

    fn cleanup_spills(&mut self) -> u32 {
        let (Some(spill), Some(memory)) = (&self.auto_spill, &self.memory) else {
            return 0;
        };
        let mut memory = lock(memory);
        let before = memory.total_bytes();
        let report = lock(spill).cleanup(&mut memory);
        if report.records_removed == 0 {
            return 0;
        }
        let freed_bytes = before.saturating_sub(memory.total_bytes());
        estimator::estimate_bytes(freed_bytes, ContentKind::Mixed)
    }

    /// Move aged tool results out of the conversation and into working
    /// memory, removing both halves of each pair atomically.
    pub fn evict_old_results(&mut self) -> Result<EvictionReport, AgentError> {
        let Some(eviction) = &mut self.result_eviction else {
            return Ok(EvictionReport::default());
        };
        let ids = eviction.eligible_ids();
        if ids.is_empty() {
            return Ok(EvictionReport::default());
        }
        let memory = self.require_memory()?;

        let mut report = EvictionReport::default();
        for id in ids {
            let Some(eviction) = &mut self.result_eviction else { break };
            let Some(record) = eviction.take(&id) else { continue };

            let key = ToolResultEviction::memory_key(&record);
            let description = ToolResultEviction::memory_description(&record);
            let write = lock(&memory).set(
                key.clone(),
                description,
                json!(record.content),
                SetOptions::default(),
            );
            if let Err(e) = write {
                warn!(id = %id, error = %e, "eviction aborted: memory write failed");
                if let Some(eviction) = &mut self.result_eviction {
                    eviction.restore_record(record);
                }
                break;
            }

            let tokens_freed = self.remove_tool_pair(&id)?;
            report.evicted += 1;
            report.tokens_freed += tokens_freed;
            report.log.push(format!("evicted {id} -> {key}"));
            report.memory_keys.push(key);
        }

        if report.evicted > 0 {
            self.emit(AgentEvent::ResultsEvicted {
                evicted: report.evicted,
                tokens_freed: report.tokens_freed,
            });
        }
        Ok(report)
    }

    // -- persistence ----------------------------------------------------

    /// Serialize everything the manager owns, in the v2 state layout.
    pub fn state(&self) -> Value {
        let (messages, metadata) = self.conversation.to_state();
        let mut plugins: BTreeMap<String, Value> = self.plugins.states();
        if let Some(tracker) = &self.tracker {
            plugins.insert("tool_output_tracker".into(), tracker.state());
        }
        if let Some(spill) = &self.auto_spill {
            plugins.insert("auto_spill".into(), lock(spill).state());
        }

        json!({
            "version": 2,
            "core": {
                "system_prompt": self.system_prompt,
                "instructions": self.instructions,
                "conversation": messages,
                "message_metadata": metadata,
                "protected_from_index": self.conversation.protected_from_index(),
                "tool_calls": self.result_eviction.as_ref().map(|e| e.state()),
            },
            "tools": Value::Array(vec![]),
            "memory": self.memory.as_ref().map(|m| lock(m).serialize()),
            "permissions": Value::Null,
            "plugins": plugins,
            "agent_state": Value::Null,
            "config": {
                "max_context_tokens": self.max_context_tokens,
                "response_reserve": self.response_reserve,
                "strategy": self.strategy,
                "features": self.features,
                "task_type": self.profile.task_type,
            },
        })
    }

    /// Restore from a persisted blob. v1 blobs are upgraded on the way in.
    pub fn restore_state(&mut self, blob: &Value) -> Result<(), AgentError> {
        let state = upgrade_state(blob.clone())?;
        let core = state
            .get("core")
            .ok_or_else(|| AgentError::Session("state missing core".into()))?;

        let messages: Vec<Message> = serde_json::from_value(
            core.get("conversation").cloned().unwrap_or(json!([])),
        )
        .map_err(|e| AgentError::Session(format!("bad conversation: {e}")))?;
        let metadata: std::collections::HashMap<String, MessageMeta> = serde_json::from_value(
            core.get("message_metadata").cloned().unwrap_or(json!({})),
        )
        .map_err(|e| AgentError::Session(format!("bad message metadata: {e}")))?;
        self.conversation = Conversation::from_state(messages, metadata);

        if let Some(prompt) = core.get("system_prompt").and_then(Value::as_str) {
            self.system_prompt = prompt.to_string();
        }
        self.instructions = core
            .get("instructions")
            .and_then(Value::as_str)
            .map(str::to_string);

        if let (Some(eviction), Some(tool_calls)) =
            (&mut self.result_eviction, core.get("tool_calls"))
        {
            if !tool_calls.is_null() {
                eviction.restore_state(tool_calls);
            }
        }

        if let (Some(handle), Some(blob)) = (&self.memory, state.get("memory")) {
            if !blob.is_null() {
                *lock(handle) = WorkingMemory::restore(blob)?;
            }
        }

        if let Some(plugins) = state.get("plugins").and_then(Value::as_object) {
            if let (Some(tracker), Some(blob)) = (&mut self.tracker, plugins.get("tool_output_tracker"))
            {
                tracker.restore_state(blob);
            }
            if let (Some(spill), Some(blob)) = (&self.auto_spill, plugins.get("auto_spill")) {
                lock(spill).restore_state(blob);
            }
            let named: BTreeMap<String, Value> = plugins
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            self.plugins.restore_states(&named);
        }

        if let Some(config) = state.get("config") {
            if let Some(total) = config.get("max_context_tokens").and_then(Value::as_u64) {
                self.max_context_tokens = total as u32;
            }
            if let Some(reserve) = config.get("response_reserve").and_then(Value::as_f64) {
                self.response_reserve = reserve as f32;
            }
            if let Some(strategy) = config.get("strategy") {
                if let Ok(strategy) = serde_json::from_value(strategy.clone()) {
                    self.strategy = strategy;
                }
            }
            if let Some(task_type) = config.get("task_type") {
                if let Ok(task_type) = serde_json::from_value::<TaskType>(task_type.clone()) {
                    self.set_task_type(task_type);
                }
            }
        }

        Ok(())
    }

    pub async fn save(
        &self,
        store: &dyn SessionStore,
        id: &str,
        metadata: Option<Value>,
    ) -> Result<(), AgentError> {
        store.save(id, &self.state(), metadata.as_ref()).await
    }

    pub async fn load(&mut self, store: &dyn SessionStore, id: &str) -> Result<bool, AgentError> {
        match store.load(id).await? {
            Some(stored) => {
                self.restore_state(&stored.state)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Plain-text rendering of a message range, for the components format and
/// for budget-free inspection.
fn render_transcript(conversation: &Conversation, start: usize, end: usize) -> String {
    let mut out = String::new();
    for i in start..end.min(conversation.len()) {
        let Some(msg) = conversation.get(i) else { continue };
        let role = match msg.role {
            crate::conversation::Role::User => "user",
            crate::conversation::Role::Assistant => "assistant",
            crate::conversation::Role::Developer => "developer",
        };
        for part in &msg.parts {
            match part {
                ContentPart::InputText { text } | ContentPart::OutputText { text } => {
                    out.push_str(&format!("{role}: {text}\n"));
                }
                ContentPart::ToolUse { id, name, .. } => {
                    out.push_str(&format!("{role}: [tool_use {name} {id}]\n"));
                }
                ContentPart::ToolResult { tool_use_id, content, error } => {
                    let tag = if error.is_some() { "error" } else { "ok" };
                    out.push_str(&format!("{role}: [tool_result {tool_use_id} {tag}] {content}\n"));
                }
                ContentPart::ImageUrl { url, .. } => {
                    out.push_str(&format!("{role}: [image {url}]\n"));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Tier;
    use serde_json::json;

    fn manager(total_tokens: u32, strategy: CompactionStrategy) -> ContextManager {
        ContextManager::new(ContextConfig {
            system_prompt: "You are a careful assistant.".into(),
            max_context_tokens: total_tokens,
            response_reserve: 0.15,
            strategy,
            auto_spill: AutoSpillConfig {
                threshold_bytes: 1024,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap()
    }

    fn add_pair(ctx: &mut ContextManager, id: &str, tool: &str, result: &str) {
        ctx.add_assistant_response(vec![ContentPart::ToolUse {
            id: id.into(),
            name: tool.into(),
            input: json!({}),
        }]);
        ctx.add_tool_results(vec![ToolResultItem::ok(id, tool, result)])
            .unwrap();
    }

    #[test]
    fn feature_validation_rejects_spill_without_memory() {
        let features = Features {
            memory: false,
            in_context_memory: false,
            tool_result_eviction: false,
            ..Default::default()
        };
        // auto_spill still on: invalid.
        let err = ContextManager::new(ContextConfig {
            features,
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, AgentError::Configuration(_)));
    }

    #[test]
    fn history_disabled_makes_adds_noops() {
        let mut ctx = ContextManager::new(ContextConfig {
            features: Features {
                history: false,
                ..Features::minimal()
            },
            ..Default::default()
        })
        .unwrap();
        assert!(ctx.add_user_message("hello").is_none());
        assert_eq!(ctx.conversation().len(), 0);
    }

    #[test]
    fn prepare_orders_components_deterministically() {
        let mut ctx = manager(100_000, CompactionStrategy::Proactive);
        ctx.add_user_message("hi");
        {
            let memory = ctx.require_memory().unwrap();
            lock(&memory)
                .set("findings.x", "a finding", json!("v"), SetOptions::default())
                .unwrap();
        }

        let prepared = ctx
            .prepare(PrepareOptions {
                format: PrepareFormat::Components,
                ..Default::default()
            })
            .unwrap();
        let PreparedOutput::Components(components) = prepared.output else {
            panic!("asked for components");
        };
        let names: Vec<&str> = components.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names[0], "system_prompt");
        assert!(names.contains(&"conversation_history"));
        assert!(names.contains(&"memory_index"));
        assert_eq!(*names.last().unwrap(), "current_input");
        let hist = names.iter().position(|n| *n == "conversation_history").unwrap();
        let mem = names.iter().position(|n| *n == "memory_index").unwrap();
        assert!(hist < mem);
    }

    #[test]
    fn prepare_protects_tail_and_reports_budget() {
        let mut ctx = manager(1000, CompactionStrategy::Lazy);
        ctx.add_user_message("short question");
        let prepared = ctx.prepare(PrepareOptions::default()).unwrap();
        assert_eq!(
            ctx.conversation().protected_from_index(),
            ctx.conversation().len()
        );
        assert!(prepared.budget.reserved == 150);
        assert!(prepared.budget.component("system_prompt") > 0);
    }

    #[test]
    fn critical_budget_triggers_proactive_compaction() {
        // Tiny window, conversation near the brim.
        let mut ctx = manager(1000, CompactionStrategy::Proactive);
        for i in 0..6 {
            ctx.add_user_message(&format!("message {i}: {}", "pad ".repeat(120)));
        }
        // Everything so far is compactable; the new prepare protects only
        // from here on.
        let prepared = ctx.prepare(PrepareOptions::default()).unwrap();
        // Budget after compaction must have improved below critical.
        assert!(
            prepared.budget.status != BudgetStatus::Critical,
            "status still {:?} at {:.0}%",
            prepared.budget.status,
            prepared.budget.utilization_percent
        );
        assert!(ctx.conversation().len() < 6);
    }

    #[test]
    fn lazy_strategy_leaves_warning_alone() {
        let mut ctx = manager(1000, CompactionStrategy::Lazy);
        for _ in 0..3 {
            ctx.add_user_message(&"pad ".repeat(170));
        }
        let before = ctx.conversation().len();
        let prepared = ctx.prepare(PrepareOptions::default()).unwrap();
        // ~680 used + 150 reserved = ~83%: warning, under lazy's 90%.
        assert_eq!(prepared.budget.status, BudgetStatus::Warning);
        assert_eq!(ctx.conversation().len(), before);
    }

    #[test]
    fn oversized_tool_output_spills_into_memory() {
        let mut ctx = manager(100_000, CompactionStrategy::Proactive);
        ctx.add_user_message("fetch it");
        ctx.add_assistant_response(vec![ContentPart::ToolUse {
            id: "t1".into(),
            name: "web_fetch".into(),
            input: json!({"url": "https://example.com/big"}),
        }]);
        ctx.add_tool_results(vec![ToolResultItem::ok(
            "t1",
            "web_fetch",
            "x".repeat(6 * 1024),
        )
        .with_args(json!({"url": "https://example.com/big"}))])
            .unwrap();

        let memory = ctx.require_memory().unwrap();
        let keys: Vec<String> = lock(&memory).keys().iter().map(|s| s.to_string()).collect();
        let spilled: Vec<&String> = keys
            .iter()
            .filter(|k| k.starts_with("raw.autospill_web_fetch_"))
            .collect();
        assert_eq!(spilled.len(), 1);

        // The conversation carries the stub, not the 6 KiB payload.
        let last = ctx.conversation().messages().last().unwrap();
        if let ContentPart::ToolResult { content, .. } = &last.parts[0] {
            assert!(content.contains("saved to working memory"));
            assert!(content.len() < 512);
        } else {
            panic!("expected tool result part");
        }
    }

    #[test]
    fn aged_tool_results_move_to_memory_with_pairs_intact() {
        // Pairs accumulate over many iterations; old ones get evicted,
        // fresh ones survive, transcript stays valid.
        let mut ctx = ContextManager::new(ContextConfig {
            system_prompt: "sys".into(),
            max_context_tokens: 100_000,
            strategy: CompactionStrategy::Lazy,
            eviction: EvictionConfig {
                min_iterations_age: 3,
                max_tracked_bytes: 1024 * 1024,
            },
            ..Default::default()
        })
        .unwrap();

        for i in 0..10 {
            ctx.prepare(PrepareOptions::default()).unwrap();
            add_pair(
                &mut ctx,
                &format!("t{i}"),
                "search",
                &format!("result {i}"),
            );
        }
        ctx.prepare(PrepareOptions::default()).unwrap();

        assert!(ctx.conversation().dangling_ids().is_empty());

        let memory = ctx.require_memory().unwrap();
        let mem = lock(&memory);
        // The earliest pairs aged out and live in memory now.
        assert!(mem.has("tool_results.search_t0"));
        assert!(mem.has("tool_results.search_t1"));
        let present: Vec<String> = ctx
            .conversation()
            .messages()
            .iter()
            .flat_map(|m| m.tool_use_ids().into_iter().map(String::from).collect::<Vec<_>>())
            .collect();
        // The most recent pairs are still in the conversation.
        assert!(present.contains(&"t9".to_string()));
        for id in &present {
            assert!(
                !mem.has(&format!("tool_results.search_{id}")),
                "{id} both in conversation and memory"
            );
        }
    }

    #[test]
    fn research_profile_compacts_history_before_memory_index() {
        // Research profile: conversation_history priority 10, memory_index
        // 3. History must shrink first.
        let mut ctx = ContextManager::new(ContextConfig {
            system_prompt: "sys".into(),
            max_context_tokens: 1000,
            response_reserve: 0.15,
            strategy: CompactionStrategy::Proactive,
            task_type: Some(detect_task_type(
                "Research competitors and summarize findings.",
            )),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(ctx.task_type(), TaskType::Research);

        {
            let memory = ctx.require_memory().unwrap();
            let mut mem = lock(&memory);
            for i in 0..4 {
                mem.set(
                    format!("findings.f{i}"),
                    format!("finding {i}"),
                    json!("short"),
                    SetOptions::default(),
                )
                .unwrap();
            }
        }
        for _ in 0..6 {
            ctx.add_user_message(&"research notes ".repeat(25));
        }
        let before_len = ctx.conversation().len();

        let prepared = ctx.prepare(PrepareOptions::default()).unwrap();
        assert!(prepared.budget.component("system_prompt") > 0);
        let system = match ctx
            .prepare(PrepareOptions::default())
            .unwrap()
            .output
        {
            PreparedOutput::LlmInput { system, .. } => system,
            _ => unreachable!(),
        };
        assert!(system.contains("Task mode: research"));

        // History shrank; the memory index is intact.
        assert!(ctx.conversation().len() < before_len);
        let memory = ctx.require_memory().unwrap();
        assert_eq!(lock(&memory).len(), 4);
    }

    #[test]
    fn ensure_capacity_compacts_when_needed() {
        let mut ctx = manager(1000, CompactionStrategy::Proactive);
        for _ in 0..6 {
            ctx.add_user_message(&"filler ".repeat(100));
        }
        // Prepare marks the boundary; the next iteration may compact
        // everything before it.
        ctx.prepare(PrepareOptions::default()).unwrap();
        assert!(ctx.ensure_capacity(300).unwrap());
    }

    #[test]
    fn remove_tool_pair_frees_tokens_and_syncs_tracker() {
        let mut ctx = manager(100_000, CompactionStrategy::Lazy);
        add_pair(&mut ctx, "t1", "search", "some output");
        add_pair(&mut ctx, "t2", "search", "other output");

        let freed = ctx.remove_tool_pair("t1").unwrap();
        assert!(freed > 0);
        assert!(ctx.conversation().dangling_ids().is_empty());
        assert!(ctx.conversation().pair_locations().contains_key("t2"));
    }

    #[tokio::test]
    async fn save_and_load_over_a_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::session::FileSessionStore::new(dir.path());

        let mut ctx = manager(50_000, CompactionStrategy::Proactive);
        ctx.add_user_message("persist me");
        ctx.save(&store, "ctx1", Some(json!({"title": "demo"})))
            .await
            .unwrap();

        let mut fresh = manager(50_000, CompactionStrategy::Proactive);
        assert!(fresh.load(&store, "ctx1").await.unwrap());
        assert_eq!(fresh.conversation().len(), 1);
        assert!(!fresh.load(&store, "missing").await.unwrap());
    }

    #[test]
    fn state_roundtrip_preserves_everything() {
        let mut ctx = manager(50_000, CompactionStrategy::Aggressive);
        ctx.add_user_message("remember this");
        add_pair(&mut ctx, "t1", "search", "found things");
        {
            let memory = ctx.require_memory().unwrap();
            let mut mem = lock(&memory);
            mem.set("findings.a", "key insight", json!("42"), SetOptions::default())
                .unwrap();
            mem.set("raw.blob", "bulk", json!("data"), SetOptions::pinned())
                .unwrap();
        }

        let blob = ctx.state();
        assert_eq!(blob["version"], 2);

        let mut restored = manager(50_000, CompactionStrategy::Proactive);
        restored.restore_state(&blob).unwrap();

        assert_eq!(restored.conversation().len(), ctx.conversation().len());
        assert!(restored.conversation().dangling_ids().is_empty());
        let memory = restored.require_memory().unwrap();
        let mut mem = lock(&memory);
        assert_eq!(mem.get("findings.a"), Some(json!("42")));
        assert!(mem.peek("raw.blob").unwrap().pinned);
        assert_eq!(mem.peek("raw.blob").unwrap().tier(), Tier::Raw);
        drop(mem);
        // Strategy travels with the blob.
        assert_eq!(blob["config"]["strategy"]["strategy"], "aggressive");
    }
}
