//! Context-centric LLM agent runtime. The interesting part is not the
//! model call — it's the bounded working context around it: a token
//! budget shared by the system prompt, a growing conversation, a tiered
//! working memory, and feature plugins, kept semantically consistent
//! (tool_use/tool_result pairs never split) while compaction, eviction,
//! and auto-spill fight for space.
//!
//! Wiring order: build a [`ContextManager`] from a [`ContextConfig`],
//! register tools (the built-ins via [`register_builtin_tools`]), pick a
//! transport, and hand everything to [`Agent`].

pub mod agent;
pub mod context;
pub mod conversation;
pub mod error;
pub mod estimator;
pub mod events;
pub mod idempotency;
pub mod intent;
pub mod memory;
pub mod mode;
pub mod plan;
pub mod session;
pub mod strategy;
pub mod tools;
pub mod transport;

pub use agent::{Agent, AgentConfig, AgentTurn};
pub use context::{
    AutoSpill, AutoSpillConfig, Budget, BudgetStatus, Component, ContextConfig, ContextManager,
    ContextPlugin, EvictionConfig, Features, PluginHost, Prepared, PrepareFormat, PrepareOptions,
    PreparedOutput, PriorityProfile, SpillRecord, TaskType, ToolOutputTracker, ToolResultEviction,
    ToolResultItem,
};
pub use conversation::{ContentPart, Conversation, ImageDetail, Message, MessageMeta, Role};
pub use error::{AgentError, TransportError};
pub use estimator::ContentKind;
pub use events::AgentEvent;
pub use idempotency::{CacheStats, IdempotencyCache};
pub use intent::Intent;
pub use memory::{MemoryError, MemoryRecord, Priority, Scope, SetOptions, Tier, WorkingMemory};
pub use mode::{recommend_mode, AgentMode, ModeManager, ModeState, ModeTransition};
pub use plan::{Plan, Task, TaskStatus};
pub use session::{
    FileSessionStore, NoSessionStore, SessionStore, SessionSummary, StoredSession,
};
pub use strategy::{CompactionStats, CompactionStrategy};
pub use tools::{register_builtin_tools, ExpectedOutput, Tool, ToolContext, ToolDefinition, ToolRegistry};
pub use transport::{
    AnthropicTransport, LlmTransport, StopReason, StreamEvent, TransportRequest,
    TransportResponse, Usage,
};
