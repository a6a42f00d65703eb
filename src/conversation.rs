//! The conversation transcript: typed content parts, tool-call pairing,
//! and the protected tail that compaction may never touch.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AgentError;
use crate::estimator::{self, ContentKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    /// System-level messages. Encoded as "developer" on the wire.
    Developer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageDetail {
    Low,
    High,
    Auto,
}

/// One typed part of a message. The discriminant travels as `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    InputText {
        text: String,
    },
    OutputText {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ImageUrl {
        url: String,
        detail: ImageDetail,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl Message {
    pub fn new(role: Role, parts: Vec<ContentPart>) -> Self {
        Self {
            id: next_message_id(),
            role,
            parts,
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentPart::InputText { text: text.into() }])
    }

    pub fn assistant(parts: Vec<ContentPart>) -> Self {
        Self::new(Role::Assistant, parts)
    }

    /// Tool results ride in a user-role message. That's the canonical wire
    /// encoding; any legacy "tool" role lives in metadata only.
    pub fn tool_results(parts: Vec<ContentPart>) -> Self {
        Self::new(Role::User, parts)
    }

    /// All text content concatenated, ignoring tool traffic and images.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::InputText { text } | ContentPart::OutputText { text } => {
                    Some(text.as_str())
                }
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_use_ids(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolUse { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn estimated_tokens(&self) -> u32 {
        let v = serde_json::to_value(&self.parts).unwrap_or(Value::Null);
        estimator::estimate_json(&v, ContentKind::Mixed)
    }
}

pub(crate) fn next_message_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("msg_{ts:x}_{n}")
}

/// Per-message bookkeeping kept outside the message itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMeta {
    pub timestamp: DateTime<Utc>,
    pub estimated_tokens: u32,
    /// Role tag carried over from v1 state ("tool"). Informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_role: Option<String>,
}

/// What `remove_indices` did.
#[derive(Debug, Clone)]
pub struct RemovalOutcome {
    pub removed: usize,
    pub tokens_freed: u32,
}

/// What `remove_tool_pair` did. `removed_messages` holds the original
/// indices of messages deleted outright (emptied by the part removal).
#[derive(Debug, Clone)]
pub struct PairRemoval {
    pub tokens_freed: u32,
    pub removed_messages: Vec<usize>,
}

/// Ordered messages plus the protected-tail boundary. Messages at or after
/// `protected_from_index` belong to the in-flight iteration and are
/// immutable to compaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<Message>,
    metadata: HashMap<String, MessageMeta>,
    protected_from_index: usize,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) -> String {
        self.push_with_legacy_role(message, None)
    }

    pub fn push_with_legacy_role(
        &mut self,
        message: Message,
        legacy_role: Option<String>,
    ) -> String {
        let id = message.id.clone();
        self.metadata.insert(
            id.clone(),
            MessageMeta {
                timestamp: Utc::now(),
                estimated_tokens: message.estimated_tokens(),
                legacy_role,
            },
        );
        self.messages.push(message);
        id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, index: usize) -> Option<&Message> {
        self.messages.get(index)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn meta(&self, id: &str) -> Option<&MessageMeta> {
        self.metadata.get(id)
    }

    pub fn protected_from_index(&self) -> usize {
        self.protected_from_index
    }

    /// Mark everything currently in the transcript as protected. Called at
    /// the start of each iteration.
    pub fn protect_tail(&mut self) {
        self.protected_from_index = self.messages.len();
    }

    pub fn estimated_tokens_at(&self, index: usize) -> u32 {
        self.messages
            .get(index)
            .and_then(|m| self.metadata.get(&m.id))
            .map(|meta| meta.estimated_tokens)
            .unwrap_or(0)
    }

    /// Token estimate over a half-open index range.
    pub fn tokens_in_range(&self, start: usize, end: usize) -> u32 {
        (start..end.min(self.messages.len()))
            .map(|i| self.estimated_tokens_at(i))
            .sum()
    }

    pub fn total_tokens(&self) -> u32 {
        self.tokens_in_range(0, self.messages.len())
    }

    /// Map of tool_use id -> (index of the message carrying the use,
    /// index of the message carrying the result, if any).
    pub fn pair_locations(&self) -> HashMap<String, (usize, Option<usize>)> {
        let mut pairs: HashMap<String, (usize, Option<usize>)> = HashMap::new();
        for (i, msg) in self.messages.iter().enumerate() {
            for id in msg.tool_use_ids() {
                pairs.entry(id.to_string()).or_insert((i, None));
            }
            for id in msg.tool_result_ids() {
                if let Some(entry) = pairs.get_mut(id) {
                    entry.1 = Some(i);
                }
            }
        }
        pairs
    }

    /// The full set of message indices transitively linked to `index`
    /// through tool_use/tool_result ids. A message carrying several uses
    /// pulls in every partner result, and vice versa.
    pub fn pair_group_of(&self, index: usize) -> BTreeSet<usize> {
        let mut group = BTreeSet::new();
        let mut frontier = vec![index];
        // id -> indices of messages that mention it (as use or result)
        let mut by_id: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, msg) in self.messages.iter().enumerate() {
            for id in msg.tool_use_ids().into_iter().chain(msg.tool_result_ids()) {
                by_id.entry(id).or_default().push(i);
            }
        }

        while let Some(i) = frontier.pop() {
            if !group.insert(i) {
                continue;
            }
            let Some(msg) = self.messages.get(i) else {
                continue;
            };
            for id in msg.tool_use_ids().into_iter().chain(msg.tool_result_ids()) {
                if let Some(indices) = by_id.get(id) {
                    for &j in indices {
                        if !group.contains(&j) {
                            frontier.push(j);
                        }
                    }
                }
            }
        }
        group
    }

    /// True when `index` carries no tool_use/tool_result parts at all.
    pub fn is_unpaired(&self, index: usize) -> bool {
        self.messages
            .get(index)
            .map(|m| m.tool_use_ids().is_empty() && m.tool_result_ids().is_empty())
            .unwrap_or(true)
    }

    /// Remove a set of whole messages. Survivors keep their order; the
    /// protected boundary shifts left by the number of removed messages
    /// preceding it.
    pub fn remove_indices(&mut self, indices: &BTreeSet<usize>) -> RemovalOutcome {
        if indices.is_empty() {
            return RemovalOutcome {
                removed: 0,
                tokens_freed: 0,
            };
        }

        let mut tokens_freed = 0;
        let mut kept = Vec::with_capacity(self.messages.len() - indices.len());
        for (i, msg) in self.messages.drain(..).enumerate() {
            if indices.contains(&i) {
                tokens_freed += self
                    .metadata
                    .remove(&msg.id)
                    .map(|m| m.estimated_tokens)
                    .unwrap_or(0);
            } else {
                kept.push(msg);
            }
        }
        self.messages = kept;

        let preceding = indices
            .iter()
            .filter(|&&i| i < self.protected_from_index)
            .count();
        self.protected_from_index -= preceding;

        RemovalOutcome {
            removed: indices.len(),
            tokens_freed,
        }
    }

    /// Remove a matched tool_use/tool_result pair atomically. This is the
    /// only sanctioned way either part leaves the transcript. Messages
    /// emptied by the removal are deleted outright.
    pub fn remove_tool_pair(&mut self, tool_use_id: &str) -> Result<PairRemoval, AgentError> {
        let pairs = self.pair_locations();
        let (use_idx, result_idx) = pairs
            .get(tool_use_id)
            .copied()
            .ok_or_else(|| AgentError::Invariant(format!("unknown tool_use id: {tool_use_id}")))?;
        let result_idx = result_idx.ok_or_else(|| {
            AgentError::Invariant(format!("tool_use {tool_use_id} has no result to pair with"))
        })?;

        let mut tokens_freed = 0;
        let mut emptied = BTreeSet::new();
        for idx in [use_idx, result_idx] {
            let msg = &mut self.messages[idx];
            let before = self
                .metadata
                .get(&msg.id)
                .map(|m| m.estimated_tokens)
                .unwrap_or(0);
            msg.parts.retain(|p| match p {
                ContentPart::ToolUse { id, .. } => id != tool_use_id,
                ContentPart::ToolResult { tool_use_id: rid, .. } => rid != tool_use_id,
                _ => true,
            });
            if msg.parts.is_empty() {
                emptied.insert(idx);
                tokens_freed += before;
            } else {
                let after = msg.estimated_tokens();
                if let Some(meta) = self.metadata.get_mut(&msg.id) {
                    meta.estimated_tokens = after;
                }
                tokens_freed += before.saturating_sub(after);
            }
        }

        let removed_messages: Vec<usize> = emptied.iter().copied().collect();
        self.remove_indices(&emptied);

        Ok(PairRemoval {
            tokens_freed,
            removed_messages,
        })
    }

    /// Ids that appear as a tool_result with no earlier tool_use, or as a
    /// tool_use whose produced result vanished. Empty on a valid transcript.
    pub fn dangling_ids(&self) -> Vec<String> {
        let mut dangling = Vec::new();
        let mut seen_uses: BTreeSet<&str> = BTreeSet::new();
        let mut seen_results: BTreeSet<&str> = BTreeSet::new();
        for msg in &self.messages {
            for id in msg.tool_result_ids() {
                if !seen_uses.contains(id) {
                    dangling.push(id.to_string());
                }
                seen_results.insert(id);
            }
            for id in msg.tool_use_ids() {
                seen_uses.insert(id);
            }
        }
        dangling
    }

    // -- persistence ---------------------------------------------------

    pub fn to_state(&self) -> (Vec<Message>, HashMap<String, MessageMeta>) {
        (self.messages.clone(), self.metadata.clone())
    }

    pub fn from_state(messages: Vec<Message>, metadata: HashMap<String, MessageMeta>) -> Self {
        let protected_from_index = messages.len();
        Self {
            messages,
            metadata,
            protected_from_index,
        }
    }
}
