//! The working-memory store: a tiered key-value map with byte caps,
//! pinning, and LRU eviction. All agent-visible knowledge that isn't in
//! the conversation lives here.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::error::MemoryError;
use super::eviction::{select_evictions, EvictionCandidate, EvictionPolicy};
use super::types::{MemoryEntry, MemoryRecord, Priority, Scope};

/// Options for `set`. Defaults: session scope, normal priority, unpinned.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    pub scope: Scope,
    pub priority: Priority,
    pub pinned: bool,
}

impl SetOptions {
    pub fn pinned() -> Self {
        Self {
            pinned: true,
            ..Default::default()
        }
    }

    pub fn priority(priority: Priority) -> Self {
        Self {
            priority,
            ..Default::default()
        }
    }

    pub fn scope(scope: Scope) -> Self {
        Self {
            scope,
            ..Default::default()
        }
    }
}

const DEFAULT_SOFT_CAP: usize = 256 * 1024;
const DEFAULT_HARD_CAP: usize = 1024 * 1024;
const DEFAULT_EVICTION_BATCH: usize = 8;

#[derive(Serialize, Deserialize)]
struct MemoryState {
    entries: Vec<MemoryEntry>,
    seq: u64,
    soft_cap_bytes: usize,
    hard_cap_bytes: usize,
}

pub struct WorkingMemory {
    entries: HashMap<String, MemoryEntry>,
    soft_cap_bytes: usize,
    hard_cap_bytes: usize,
    eviction_batch: usize,
    seq: u64,
}

impl Default for WorkingMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkingMemory {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            soft_cap_bytes: DEFAULT_SOFT_CAP,
            hard_cap_bytes: DEFAULT_HARD_CAP,
            eviction_batch: DEFAULT_EVICTION_BATCH,
            seq: 0,
        }
    }

    pub fn with_caps(mut self, soft_cap_bytes: usize, hard_cap_bytes: usize) -> Self {
        self.soft_cap_bytes = soft_cap_bytes;
        self.hard_cap_bytes = hard_cap_bytes.max(soft_cap_bytes);
        self
    }

    pub fn with_eviction_batch(mut self, batch: usize) -> Self {
        self.eviction_batch = batch.max(1);
        self
    }

    /// Upsert an entry. Crossing the soft cap triggers eviction; if even
    /// after eviction the hard cap would be exceeded, the write is rolled
    /// back and `StorageFull` is returned — the caller decides whether to
    /// drop the value or demote it.
    pub fn set(
        &mut self,
        key: impl Into<String>,
        description: impl Into<String>,
        value: Value,
        opts: SetOptions,
    ) -> Result<(), MemoryError> {
        let key = key.into();
        let description = description.into();
        let size_bytes = key.len() + description.len() + value.to_string().len();

        let previous = self.entries.remove(&key);
        let seq = previous.as_ref().map(|p| p.seq).unwrap_or_else(|| {
            self.seq += 1;
            self.seq
        });
        let derived_from = previous
            .as_ref()
            .map(|p| p.derived_from.clone())
            .unwrap_or_default();

        self.entries.insert(
            key.clone(),
            MemoryEntry {
                key: key.clone(),
                description,
                value,
                priority: opts.priority,
                pinned: opts.pinned,
                scope: opts.scope,
                derived_from,
                last_access: Utc::now(),
                size_bytes,
                seq,
            },
        );

        if self.total_bytes() > self.soft_cap_bytes {
            self.evict_until_under_soft_cap(&key);
        }

        if self.total_bytes() > self.hard_cap_bytes {
            // Roll back: this write doesn't fit even after eviction.
            self.entries.remove(&key);
            if let Some(prev) = previous {
                self.entries.insert(key.clone(), prev);
            }
            warn!(key = %key, size_bytes, "working memory rejected write at hard cap");
            return Err(MemoryError::StorageFull {
                needed: size_bytes,
                hard_cap: self.hard_cap_bytes,
            });
        }

        Ok(())
    }

    /// Record a derivation edge: `key` was distilled from `parents`.
    pub fn set_derived_from(&mut self, key: &str, parents: Vec<String>) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.derived_from = parents;
        }
    }

    /// Fetch a value, bumping its access time.
    pub fn get(&mut self, key: &str) -> Option<Value> {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.last_access = Utc::now();
                Some(entry.value.clone())
            }
            None => None,
        }
    }

    /// Read an entry without touching access time.
    pub fn peek(&self, key: &str) -> Option<&MemoryEntry> {
        self.entries.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn pin(&mut self, key: &str, pinned: bool) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.pinned = pinned;
                true
            }
            None => false,
        }
    }

    /// Listing for the memory index: refined knowledge first, raw bulk
    /// last, insertion order within a tier.
    pub fn list(&self) -> Vec<MemoryRecord> {
        let mut entries: Vec<&MemoryEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| {
            b.tier()
                .eviction_rank()
                .cmp(&a.tier().eviction_rank())
                .then(a.seq.cmp(&b.seq))
        });
        entries
            .into_iter()
            .map(|e| MemoryRecord {
                key: e.key.clone(),
                description: e.description.clone(),
                effective_priority: e.effective_priority(),
                pinned: e.pinned,
                tier: e.tier(),
            })
            .collect()
    }

    /// The model-facing index: one line per entry.
    pub fn render_index(&self) -> String {
        let records = self.list();
        if records.is_empty() {
            return String::new();
        }
        let mut out = String::from("Working memory index (key [tier] description):\n");
        for r in records {
            let pin = if r.pinned { ", pinned" } else { "" };
            out.push_str(&format!(
                "- {} [{}{}] {} (priority: {:?})\n",
                r.key,
                r.tier.label(),
                pin,
                r.description,
                r.effective_priority
            ));
        }
        out
    }

    /// Evict up to `batch` entries. Returns the removed keys.
    pub fn evict(&mut self, batch: usize, policy: EvictionPolicy) -> Vec<String> {
        self.evict_with(batch, policy, false)
    }

    pub fn evict_with(
        &mut self,
        batch: usize,
        policy: EvictionPolicy,
        allow_persistent: bool,
    ) -> Vec<String> {
        let candidates: Vec<EvictionCandidate> = self
            .entries
            .values()
            .map(|e| EvictionCandidate {
                key: e.key.clone(),
                tier: e.tier(),
                priority: e.priority,
                pinned: e.pinned,
                scope: e.scope,
                last_access: e.last_access,
                size_bytes: e.size_bytes,
            })
            .collect();
        let doomed = select_evictions(&candidates, batch, policy, allow_persistent);
        let mut freed = 0usize;
        for key in &doomed {
            if let Some(entry) = self.entries.remove(key) {
                freed += entry.size_bytes;
            }
        }
        if !doomed.is_empty() {
            debug!(evicted = doomed.len(), freed_bytes = freed, "memory eviction");
        }
        doomed
    }

    /// Drop turn-scoped entries. Runs at iteration boundaries.
    pub fn clear_turn_scope(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.scope != Scope::Turn);
        before - self.entries.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.entries.values().map(|e| e.size_bytes).sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys currently present, in no particular order.
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(|k| k.as_str()).collect()
    }

    fn evict_until_under_soft_cap(&mut self, protect: &str) {
        // The just-written key is exempt for this pass; eviction exists to
        // make room for it, not to undo it.
        loop {
            if self.total_bytes() <= self.soft_cap_bytes {
                return;
            }
            let candidates: Vec<EvictionCandidate> = self
                .entries
                .values()
                .filter(|e| e.key != protect)
                .map(|e| EvictionCandidate {
                    key: e.key.clone(),
                    tier: e.tier(),
                    priority: e.priority,
                    pinned: e.pinned,
                    scope: e.scope,
                    last_access: e.last_access,
                    size_bytes: e.size_bytes,
                })
                .collect();
            let doomed = select_evictions(
                &candidates,
                self.eviction_batch,
                EvictionPolicy::Lru,
                false,
            );
            if doomed.is_empty() {
                return;
            }
            for key in doomed {
                self.entries.remove(&key);
            }
        }
    }

    // -- persistence ---------------------------------------------------

    /// Full state snapshot, caps included.
    pub fn serialize(&self) -> Value {
        let mut entries: Vec<MemoryEntry> = self.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.seq);
        serde_json::to_value(MemoryState {
            entries,
            seq: self.seq,
            soft_cap_bytes: self.soft_cap_bytes,
            hard_cap_bytes: self.hard_cap_bytes,
        })
        .unwrap_or(Value::Null)
    }

    pub fn restore(blob: &Value) -> Result<Self, MemoryError> {
        let state: MemoryState = serde_json::from_value(blob.clone())
            .map_err(|e| MemoryError::Serialization(e.to_string()))?;
        let mut memory = WorkingMemory::new()
            .with_caps(state.soft_cap_bytes, state.hard_cap_bytes);
        memory.seq = state.seq;
        memory.entries = state
            .entries
            .into_iter()
            .map(|e| (e.key.clone(), e))
            .collect();
        Ok(memory)
    }
}
