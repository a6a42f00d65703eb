use serde_json::Value;

use crate::mode::AgentMode;

/// Events emitted during agent execution, for UI streaming.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    IterationStart { iteration: usize },
    TextDelta { content: String },
    Text { content: String },
    ToolStart { name: String, input: Value },
    ToolComplete { name: String, output: String, is_error: bool },
    MessageAdded { id: String },
    BudgetWarning { utilization_percent: f32 },
    BudgetCritical { utilization_percent: f32 },
    HistoryCompacted { removed: usize, tokens_freed: u32 },
    ResultsEvicted { evicted: usize, tokens_freed: u32 },
    ModeChanged { from: AgentMode, to: AgentMode },
    PlanPending { goal: String, tasks: usize },
    PlanApproved { goal: String },
    PlanRejected { goal: String },
    TaskStarted { id: String, name: String },
    TaskProgress { id: String, message: String },
    TaskCompleted { id: String },
    TaskFailed { id: String, error: String },
    ExecutionDone { completed: usize, failed: usize },
    Finished { iterations: usize },
    Error { message: String },
}
