//! Built-in tools: the working-memory family and `autospill_process`.
//! These are the tools the context core itself depends on; everything
//! else (web, files, shell) is the embedder's business.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Value};

use super::handler::{ExpectedOutput, Tool, ToolContext, ToolDefinition};
use super::registry::ToolRegistry;
use crate::memory::{Priority, Scope, SetOptions};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn require_str<'a>(args: &'a Value, field: &str) -> Result<&'a str, String> {
    args.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing required argument: {field}"))
}

// --- memory_set ---

pub struct MemorySetTool;

#[async_trait]
impl Tool for MemorySetTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "memory_set".into(),
            description: "Store a value in working memory. Use raw.* keys for bulk source \
                          material, findings.*/summary.* for distilled knowledge."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "key": {"type": "string", "description": "Tier-prefixed key, e.g. findings.pricing"},
                    "description": {"type": "string", "description": "One-line human description"},
                    "value": {"description": "Any JSON value"},
                    "priority": {"type": "string", "enum": ["low", "normal", "high"]},
                    "pinned": {"type": "boolean"},
                    "scope": {"type": "string", "enum": ["session", "persistent", "turn"]},
                },
                "required": ["key", "description", "value"]
            }),
        }
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<String, String> {
        let memory = ctx.memory.as_ref().ok_or("working memory is disabled")?;
        let key = require_str(args, "key")?;
        let description = require_str(args, "description")?;
        let value = args.get("value").cloned().unwrap_or(Value::Null);

        let priority = match args.get("priority").and_then(Value::as_str) {
            Some("low") => Priority::Low,
            Some("high") => Priority::High,
            _ => Priority::Normal,
        };
        let scope = match args.get("scope").and_then(Value::as_str) {
            Some("persistent") => Scope::Persistent,
            Some("turn") => Scope::Turn,
            _ => Scope::Session,
        };
        let opts = SetOptions {
            priority,
            scope,
            pinned: args.get("pinned").and_then(Value::as_bool).unwrap_or(false),
        };

        lock(memory)
            .set(key, description, value, opts)
            .map_err(|e| e.to_string())?;
        Ok(format!("stored {key}"))
    }

    fn expected_output(&self) -> ExpectedOutput {
        ExpectedOutput::Small
    }
}

// --- memory_get ---

pub struct MemoryGetTool;

#[async_trait]
impl Tool for MemoryGetTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "memory_get".into(),
            description: "Read a value from working memory by key.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "key": {"type": "string"},
                },
                "required": ["key"]
            }),
        }
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<String, String> {
        let memory = ctx.memory.as_ref().ok_or("working memory is disabled")?;
        let key = require_str(args, "key")?;
        // A missing key is an answer, not an error.
        let result = match lock(memory).get(key) {
            Some(value) => json!({"found": true, "key": key, "value": value}),
            None => json!({"found": false, "key": key}),
        };
        Ok(result.to_string())
    }
}

// --- memory_delete ---

pub struct MemoryDeleteTool;

#[async_trait]
impl Tool for MemoryDeleteTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "memory_delete".into(),
            description: "Delete a working-memory entry by key.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "key": {"type": "string"},
                },
                "required": ["key"]
            }),
        }
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<String, String> {
        let memory = ctx.memory.as_ref().ok_or("working memory is disabled")?;
        let key = require_str(args, "key")?;
        let deleted = lock(memory).delete(key);
        Ok(json!({"deleted": deleted, "key": key}).to_string())
    }

    fn expected_output(&self) -> ExpectedOutput {
        ExpectedOutput::Small
    }
}

// --- memory_list ---

pub struct MemoryListTool;

#[async_trait]
impl Tool for MemoryListTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "memory_list".into(),
            description: "List working-memory entries: key, tier, description, priority.".into(),
            parameters: json!({"type": "object", "properties": {}}),
        }
    }

    async fn execute(&self, _args: &Value, ctx: &ToolContext) -> Result<String, String> {
        let memory = ctx.memory.as_ref().ok_or("working memory is disabled")?;
        let index = lock(memory).render_index();
        if index.is_empty() {
            Ok("working memory is empty".into())
        } else {
            Ok(index)
        }
    }
}

// --- autospill_process ---

pub struct AutospillProcessTool;

#[async_trait]
impl Tool for AutospillProcessTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "autospill_process".into(),
            description: "Mark a spilled tool output as processed: store your summary and \
                          link it to the raw entry so the raw bytes can be reclaimed."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "key": {"type": "string", "description": "The raw.autospill_* memory key"},
                    "summary": {"type": "string", "description": "Your distilled summary"},
                    "summary_key": {"type": "string", "description": "Optional key for the summary, e.g. findings.pricing"},
                },
                "required": ["key", "summary"]
            }),
        }
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<String, String> {
        let memory = ctx.memory.as_ref().ok_or("working memory is disabled")?;
        let spill = ctx.auto_spill.as_ref().ok_or("auto-spill is disabled")?;
        let key = require_str(args, "key")?;
        let summary = require_str(args, "summary")?;
        let summary_key = args
            .get("summary_key")
            .and_then(Value::as_str)
            .map(str::to_string);

        let stored = lock(spill).process(&mut lock(memory), key, summary, summary_key)?;
        Ok(format!("summary stored under {stored}"))
    }

    fn expected_output(&self) -> ExpectedOutput {
        ExpectedOutput::Small
    }
}

/// Register every built-in the context core relies on.
pub fn register_builtin_tools(registry: ToolRegistry) -> ToolRegistry {
    registry
        .add(MemorySetTool)
        .add(MemoryGetTool)
        .add(MemoryDeleteTool)
        .add(MemoryListTool)
        .add(AutospillProcessTool)
}
