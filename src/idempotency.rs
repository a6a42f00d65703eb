//! TTL + LRU cache for tools that declare themselves idempotent. Keyed by
//! a digest of the tool name and canonicalized arguments, so argument
//! object-key order never splits the cache.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Recursively stringify with object keys sorted. Arrays keep their order.
pub fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonicalize(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

pub fn cache_key(tool: &str, args: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool.as_bytes());
    hasher.update([0]);
    hasher.update(canonicalize(args).as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone)]
struct CacheEntry {
    tool: String,
    value: String,
    inserted_at: Instant,
    last_hit_at: Instant,
    hits: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct IdempotencyCache {
    entries: HashMap<String, CacheEntry>,
    ttl: Duration,
    max_entries: usize,
    hits: u64,
    misses: u64,
}

impl IdempotencyCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
            hits: 0,
            misses: 0,
        }
    }

    /// Cache lookup. Never fails; expired or absent entries are a miss.
    pub fn get(&mut self, tool: &str, args: &Value) -> Option<String> {
        let key = cache_key(tool, args);
        let now = Instant::now();
        match self.entries.get_mut(&key) {
            Some(entry) if now.duration_since(entry.inserted_at) < self.ttl => {
                entry.last_hit_at = now;
                entry.hits += 1;
                self.hits += 1;
                Some(entry.value.clone())
            }
            Some(_) => {
                self.entries.remove(&key);
                self.misses += 1;
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn set(&mut self, tool: &str, args: &Value, value: impl Into<String>) {
        let key = cache_key(tool, args);
        let now = Instant::now();
        self.entries.insert(
            key,
            CacheEntry {
                tool: tool.to_string(),
                value: value.into(),
                inserted_at: now,
                last_hit_at: now,
                hits: 0,
            },
        );
        if self.entries.len() > self.max_entries {
            self.evict_overflow();
        }
    }

    /// Drop every cached result for a tool. Call after a mutation the tool
    /// observes (e.g. the agent edited a file the tool reads).
    pub fn invalidate_tool(&mut self, tool: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.tool != tool);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(tool, removed, "idempotency cache invalidated");
        }
        removed
    }

    /// Periodic maintenance: drop expired entries.
    pub fn tick(&mut self) -> usize {
        let now = Instant::now();
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.duration_since(e.inserted_at) < ttl);
        before - self.entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
        }
    }

    fn evict_overflow(&mut self) {
        // Expired first, then least-recently-hit until back under the cap.
        self.tick();
        while self.entries.len() > self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_hit_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonicalize_sorts_keys_recursively() {
        let a = json!({"b": 1, "a": {"z": true, "y": [1, 2]}});
        let b = json!({"a": {"y": [1, 2], "z": true}, "b": 1});
        assert_eq!(canonicalize(&a), canonicalize(&b));
        // Array order is significant.
        let c = json!({"a": {"y": [2, 1], "z": true}, "b": 1});
        assert_ne!(canonicalize(&a), canonicalize(&c));
    }

    #[test]
    fn key_ignores_argument_order() {
        let k1 = cache_key("web_search", &json!({"q": "rust", "limit": 5}));
        let k2 = cache_key("web_search", &json!({"limit": 5, "q": "rust"}));
        assert_eq!(k1, k2);
        assert_ne!(k1, cache_key("web_fetch", &json!({"q": "rust", "limit": 5})));
    }

    #[test]
    fn get_after_set_hits() {
        let mut cache = IdempotencyCache::new(Duration::from_secs(60), 16);
        let args = json!({"q": "rust"});
        assert_eq!(cache.get("search", &args), None);
        cache.set("search", &args, "results");
        assert_eq!(cache.get("search", &args), Some("results".into()));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn expired_entries_miss() {
        let mut cache = IdempotencyCache::new(Duration::from_millis(0), 16);
        let args = json!({});
        cache.set("search", &args, "stale");
        assert_eq!(cache.get("search", &args), None);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn overflow_evicts_least_recently_hit() {
        let mut cache = IdempotencyCache::new(Duration::from_secs(60), 2);
        cache.set("t", &json!({"n": 1}), "one");
        cache.set("t", &json!({"n": 2}), "two");
        // Touch n=1 so n=2 becomes the LRU entry.
        assert!(cache.get("t", &json!({"n": 1})).is_some());
        cache.set("t", &json!({"n": 3}), "three");

        assert_eq!(cache.stats().entries, 2);
        assert!(cache.get("t", &json!({"n": 1})).is_some());
        assert!(cache.get("t", &json!({"n": 3})).is_some());
        assert!(cache.get("t", &json!({"n": 2})).is_none());
    }

    #[test]
    fn invalidate_tool_only_hits_that_tool() {
        let mut cache = IdempotencyCache::new(Duration::from_secs(60), 16);
        cache.set("read_file", &json!({"path": "a"}), "aa");
        cache.set("read_file", &json!({"path": "b"}), "bb");
        cache.set("web_search", &json!({"q": "x"}), "xx");

        assert_eq!(cache.invalidate_tool("read_file"), 2);
        assert!(cache.get("web_search", &json!({"q": "x"})).is_some());
        assert!(cache.get("read_file", &json!({"path": "a"})).is_none());
    }

    #[test]
    fn tick_prunes_expired() {
        let mut cache = IdempotencyCache::new(Duration::from_millis(0), 16);
        cache.set("t", &json!({"n": 1}), "v");
        cache.set("t", &json!({"n": 2}), "v");
        assert_eq!(cache.tick(), 2);
    }
}
