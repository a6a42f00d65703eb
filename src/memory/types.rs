use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Eviction preference. High-priority entries are only reaped when nothing
/// else is left to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Entry lifetime. Turn-scoped entries vanish at the next iteration
/// boundary; persistent entries survive normal eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Session,
    Persistent,
    Turn,
}

impl Default for Scope {
    fn default() -> Self {
        Self::Session
    }
}

/// Classification encoded in the key prefix. `raw.*` is bulk source
/// material and goes first when space is needed; `findings.*`/`summary.*`
/// is distilled knowledge and goes last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Raw,
    Neutral,
    Refined,
}

impl Tier {
    pub fn of(key: &str) -> Self {
        if key.starts_with("raw.") {
            Self::Raw
        } else if key.starts_with("findings.") || key.starts_with("summary.") {
            Self::Refined
        } else {
            Self::Neutral
        }
    }

    /// Lower rank is evicted sooner.
    pub fn eviction_rank(self) -> u8 {
        match self {
            Self::Raw => 0,
            Self::Neutral => 1,
            Self::Refined => 2,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Neutral => "neutral",
            Self::Refined => "refined",
        }
    }
}

/// A single working-memory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub description: String,
    pub value: Value,
    pub priority: Priority,
    pub pinned: bool,
    pub scope: Scope,
    #[serde(default)]
    pub derived_from: Vec<String>,
    pub last_access: DateTime<Utc>,
    pub size_bytes: usize,
    /// Insertion sequence, for stable listing order.
    pub seq: u64,
}

impl MemoryEntry {
    pub fn tier(&self) -> Tier {
        Tier::of(&self.key)
    }

    /// Pinned entries always rank as high priority in listings.
    pub fn effective_priority(&self) -> Priority {
        if self.pinned {
            Priority::High
        } else {
            self.priority
        }
    }
}

/// What `list()` returns — the record shape the memory index is rendered
/// from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRecord {
    pub key: String,
    pub description: String,
    pub effective_priority: Priority,
    pub pinned: bool,
    pub tier: Tier,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_derives_from_prefix() {
        assert_eq!(Tier::of("raw.autospill_web_fetch_page_1"), Tier::Raw);
        assert_eq!(Tier::of("findings.a"), Tier::Refined);
        assert_eq!(Tier::of("summary.report"), Tier::Refined);
        assert_eq!(Tier::of("tool_results.search_t1"), Tier::Neutral);
        assert_eq!(Tier::of("notes"), Tier::Neutral);
    }

    #[test]
    fn raw_evicts_before_refined() {
        assert!(Tier::Raw.eviction_rank() < Tier::Neutral.eviction_rank());
        assert!(Tier::Neutral.eviction_rank() < Tier::Refined.eviction_rank());
    }

    #[test]
    fn pinned_reads_as_high_priority() {
        let entry = MemoryEntry {
            key: "k".into(),
            description: String::new(),
            value: Value::Null,
            priority: Priority::Low,
            pinned: true,
            scope: Scope::Session,
            derived_from: vec![],
            last_access: Utc::now(),
            size_bytes: 0,
            seq: 0,
        };
        assert_eq!(entry.effective_priority(), Priority::High);
    }
}
