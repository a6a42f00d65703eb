use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::context::AutoSpill;
use crate::idempotency::IdempotencyCache;
use crate::memory::WorkingMemory;

/// Schema half of a tool: what the LLM sees.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema for the arguments object.
    pub parameters: Value,
}

impl ToolDefinition {
    /// The complete JSON tool definition sent to the LLM API.
    pub fn schema(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "input_schema": self.parameters,
        })
    }
}

/// Rough output-size hint; `Variable` outputs are auto-spill candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedOutput {
    Small,
    Variable,
}

/// Handles a tool receives at execution time. Absent features are `None`.
#[derive(Clone)]
pub struct ToolContext {
    pub memory: Option<Arc<Mutex<WorkingMemory>>>,
    pub idempotency: Option<Arc<Mutex<IdempotencyCache>>>,
    pub auto_spill: Option<Arc<Mutex<AutoSpill>>>,
    pub cancel: CancellationToken,
}

impl ToolContext {
    /// A context with nothing wired up. Useful for tests and tools that
    /// need no shared state.
    pub fn bare() -> Self {
        Self {
            memory: None,
            idempotency: None,
            auto_spill: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// A tool the agent can call. Errors are plain strings — they become
/// error-flagged tool results, never crate errors.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<String, String>;

    /// Safe tools may be served from the idempotency cache.
    fn idempotency_safe(&self) -> bool {
        false
    }

    fn expected_output(&self) -> ExpectedOutput {
        ExpectedOutput::Variable
    }

    /// One-line human description of a concrete call, for spill records.
    fn describe_call(&self, _args: &Value) -> Option<String> {
        None
    }
}
