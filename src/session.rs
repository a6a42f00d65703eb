//! Session persistence: an opaque blob store plus the versioned state
//! layout. v2 is canonical; v1 blobs are upgraded on read, with legacy
//! per-message records becoming single-part text messages.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::conversation::{ContentPart, Message, MessageMeta, Role};
use crate::error::AgentError;

pub const STATE_VERSION: u64 = 2;

/// Persists agent state so a session can stop and resume at the same spot.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, id: &str, state: &Value, metadata: Option<&Value>)
        -> Result<(), AgentError>;

    async fn load(&self, id: &str) -> Result<Option<StoredSession>, AgentError>;

    async fn exists(&self, id: &str) -> Result<bool, AgentError>;

    /// Returns whether anything was actually removed.
    async fn delete(&self, id: &str) -> Result<bool, AgentError>;

    async fn list(&self) -> Result<Vec<SessionSummary>, AgentError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSession {
    pub state: Value,
    pub metadata: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub updated_at: DateTime<Utc>,
    pub metadata: Option<Value>,
}

// --- NoSessionStore ---

/// No persistence. Fire-and-forget.
pub struct NoSessionStore;

#[async_trait]
impl SessionStore for NoSessionStore {
    async fn save(&self, _: &str, _: &Value, _: Option<&Value>) -> Result<(), AgentError> {
        Ok(())
    }

    async fn load(&self, _: &str) -> Result<Option<StoredSession>, AgentError> {
        Ok(None)
    }

    async fn exists(&self, _: &str) -> Result<bool, AgentError> {
        Ok(false)
    }

    async fn delete(&self, _: &str) -> Result<bool, AgentError> {
        Ok(false)
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, AgentError> {
        Ok(Vec::new())
    }
}

// --- FileSessionStore ---

/// Saves sessions to disk as JSON, one file per id.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn save(
        &self,
        id: &str,
        state: &Value,
        metadata: Option<&Value>,
    ) -> Result<(), AgentError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| AgentError::Session(e.to_string()))?;
        let stored = StoredSession {
            state: state.clone(),
            metadata: metadata.cloned(),
            updated_at: Utc::now(),
        };
        let body = serde_json::to_string_pretty(&stored)
            .map_err(|e| AgentError::Session(e.to_string()))?;
        tokio::fs::write(self.path(id), body)
            .await
            .map_err(|e| AgentError::Session(e.to_string()))?;
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<StoredSession>, AgentError> {
        match tokio::fs::read_to_string(self.path(id)).await {
            Ok(body) => {
                let stored: StoredSession = serde_json::from_str(&body)
                    .map_err(|e| AgentError::Session(e.to_string()))?;
                Ok(Some(stored))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AgentError::Session(e.to_string())),
        }
    }

    async fn exists(&self, id: &str) -> Result<bool, AgentError> {
        Ok(tokio::fs::try_exists(self.path(id))
            .await
            .unwrap_or(false))
    }

    async fn delete(&self, id: &str) -> Result<bool, AgentError> {
        match tokio::fs::remove_file(self.path(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(AgentError::Session(e.to_string())),
        }
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, AgentError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AgentError::Session(e.to_string())),
        };

        let mut summaries = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AgentError::Session(e.to_string()))?
        {
            let path = entry.path();
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_string)
            else {
                continue;
            };
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(body) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            let Ok(stored) = serde_json::from_str::<StoredSession>(&body) else {
                continue;
            };
            summaries.push(SessionSummary {
                id,
                updated_at: stored.updated_at,
                metadata: stored.metadata,
            });
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }
}

// --- state versioning ---

/// Accept a persisted state blob at any supported version, returning the
/// canonical v2 layout.
pub fn upgrade_state(blob: Value) -> Result<Value, AgentError> {
    match blob.get("version").and_then(Value::as_u64) {
        Some(STATE_VERSION) => Ok(blob),
        Some(1) => migrate_v1(blob),
        other => Err(AgentError::Session(format!(
            "unsupported state version: {other:?}"
        ))),
    }
}

/// v1 kept `core.history` as flat `{role, content}` records. Each becomes
/// a single-part text message; the legacy `tool` role maps to `user` and
/// survives only as metadata.
fn migrate_v1(blob: Value) -> Result<Value, AgentError> {
    let core = blob
        .get("core")
        .cloned()
        .ok_or_else(|| AgentError::Session("v1 state missing core".into()))?;
    let history = core
        .get("history")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut messages: Vec<Message> = Vec::with_capacity(history.len());
    let mut metadata: HashMap<String, MessageMeta> = HashMap::with_capacity(history.len());

    for record in history {
        let legacy_role = record
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or("user")
            .to_string();
        let content = record
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let (role, part, carried) = match legacy_role.as_str() {
            "assistant" => (
                Role::Assistant,
                ContentPart::OutputText { text: content },
                None,
            ),
            "system" | "developer" => (
                Role::Developer,
                ContentPart::InputText { text: content },
                None,
            ),
            "user" => (Role::User, ContentPart::InputText { text: content }, None),
            _ => (
                Role::User,
                ContentPart::InputText { text: content },
                Some(legacy_role.clone()),
            ),
        };

        let message = Message::new(role, vec![part]);
        metadata.insert(
            message.id.clone(),
            MessageMeta {
                timestamp: Utc::now(),
                estimated_tokens: message.estimated_tokens(),
                legacy_role: carried,
            },
        );
        messages.push(message);
    }

    let message_count = messages.len();
    info!(messages = message_count, "migrated v1 session state");

    Ok(json!({
        "version": STATE_VERSION,
        "core": {
            "system_prompt": core.get("system_prompt").cloned().unwrap_or(Value::Null),
            "instructions": core.get("instructions").cloned().unwrap_or(Value::Null),
            "conversation": messages,
            "message_metadata": metadata,
            "protected_from_index": message_count,
            "tool_calls": Value::Null,
        },
        "tools": blob.get("tools").cloned().unwrap_or(json!([])),
        "memory": blob.get("memory").cloned().unwrap_or(Value::Null),
        "permissions": blob.get("permissions").cloned().unwrap_or(Value::Null),
        "plugins": blob.get("plugins").cloned().unwrap_or(json!({})),
        "agent_state": Value::Null,
        "config": blob.get("config").cloned().unwrap_or(json!({})),
    }))
}
