//! Eviction selection. Pure: candidates in, doomed keys out. The store
//! applies the deletions.

use chrono::{DateTime, Utc};

use super::types::{Priority, Scope, Tier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Least-recently-accessed first; ties broken by larger size, so one
    /// eviction frees as much as possible.
    Lru,
}

/// Lightweight projection of an entry for eviction scoring.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub key: String,
    pub tier: Tier,
    pub priority: Priority,
    pub pinned: bool,
    pub scope: Scope,
    pub last_access: DateTime<Utc>,
    pub size_bytes: usize,
}

/// Select up to `batch` keys to evict.
///
/// Pinned entries are never selected. Persistent-scope entries are skipped
/// unless `allow_persistent`. High-priority entries are skipped while any
/// other candidate remains. Within the eligible set, `raw.*` goes before
/// every other tier, then least-recently-accessed, then larger-first.
pub fn select_evictions(
    candidates: &[EvictionCandidate],
    batch: usize,
    policy: EvictionPolicy,
    allow_persistent: bool,
) -> Vec<String> {
    let EvictionPolicy::Lru = policy;

    let eligible: Vec<&EvictionCandidate> = candidates
        .iter()
        .filter(|c| !c.pinned && (allow_persistent || c.scope != Scope::Persistent))
        .collect();

    let mut pool: Vec<&EvictionCandidate> = eligible
        .iter()
        .copied()
        .filter(|c| c.priority != Priority::High)
        .collect();
    if pool.is_empty() {
        // Nothing expendable left; high-priority entries become fair game.
        pool = eligible;
    }

    pool.sort_by(|a, b| {
        a.tier
            .eviction_rank()
            .cmp(&b.tier.eviction_rank())
            .then(a.last_access.cmp(&b.last_access))
            .then(b.size_bytes.cmp(&a.size_bytes))
            .then(a.key.cmp(&b.key))
    });

    pool.into_iter()
        .take(batch)
        .map(|c| c.key.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn candidate(key: &str, age_minutes: i64) -> EvictionCandidate {
        EvictionCandidate {
            key: key.into(),
            tier: Tier::of(key),
            priority: Priority::Normal,
            pinned: false,
            scope: Scope::Session,
            last_access: Utc::now() - Duration::minutes(age_minutes),
            size_bytes: 100,
        }
    }

    #[test]
    fn lru_orders_by_last_access() {
        let candidates = vec![
            candidate("fresh", 1),
            candidate("stale", 60),
            candidate("middling", 30),
        ];
        let picked = select_evictions(&candidates, 2, EvictionPolicy::Lru, false);
        assert_eq!(picked, vec!["stale".to_string(), "middling".to_string()]);
    }

    #[test]
    fn ties_break_toward_larger_entries() {
        let mut small = candidate("small", 30);
        let mut big = candidate("big", 30);
        small.last_access = big.last_access;
        small.size_bytes = 10;
        big.size_bytes = 10_000;
        let picked = select_evictions(&[small, big], 1, EvictionPolicy::Lru, false);
        assert_eq!(picked, vec!["big".to_string()]);
    }

    #[test]
    fn raw_tier_goes_first_regardless_of_recency() {
        let candidates = vec![
            candidate("findings.old", 600),
            candidate("notes", 600),
            candidate("raw.fresh", 1),
        ];
        let picked = select_evictions(&candidates, 1, EvictionPolicy::Lru, false);
        assert_eq!(picked, vec!["raw.fresh".to_string()]);
    }

    #[test]
    fn pinned_never_selected() {
        let mut pinned = candidate("raw.pinned", 600);
        pinned.pinned = true;
        let picked = select_evictions(&[pinned], 5, EvictionPolicy::Lru, false);
        assert!(picked.is_empty());
    }

    #[test]
    fn high_priority_survives_while_others_remain() {
        let mut important = candidate("important", 600);
        important.priority = Priority::High;
        let expendable = candidate("expendable", 1);
        let picked = select_evictions(
            &[important.clone(), expendable],
            2,
            EvictionPolicy::Lru,
            false,
        );
        assert_eq!(picked, vec!["expendable".to_string()]);

        // With no alternatives, high priority is taken after all.
        let picked = select_evictions(&[important], 1, EvictionPolicy::Lru, false);
        assert_eq!(picked, vec!["important".to_string()]);
    }

    #[test]
    fn persistent_requires_explicit_allowance() {
        let mut durable = candidate("durable", 600);
        durable.scope = Scope::Persistent;
        assert!(select_evictions(&[durable.clone()], 1, EvictionPolicy::Lru, false).is_empty());
        assert_eq!(
            select_evictions(&[durable], 1, EvictionPolicy::Lru, true),
            vec!["durable".to_string()]
        );
    }
}
