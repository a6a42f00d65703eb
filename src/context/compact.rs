//! Conversation compaction: pick which messages may leave. The two
//! invariants carried here: tool pairs leave together or not at all, and
//! nothing at or past the protected boundary is touched.

use std::collections::BTreeSet;

use tracing::debug;

use crate::conversation::Conversation;

/// Outcome of one `compact_conversation` pass. `removed_indices` holds the
/// original positions so index-tracking observers can resynchronize.
#[derive(Debug, Clone, Default)]
pub struct CompactionOutcome {
    pub removed: usize,
    pub tokens_freed: u32,
    pub removed_indices: BTreeSet<usize>,
    pub log: Vec<String>,
}

/// Indices eligible for removal: everything before the protected boundary
/// whose entire pair group (if any) also sits before the boundary.
pub fn safe_candidates(conversation: &Conversation) -> Vec<usize> {
    let end = conversation.protected_from_index();
    (0..end)
        .filter(|&i| {
            conversation.is_unpaired(i)
                || conversation.pair_group_of(i).iter().all(|&j| j < end)
        })
        .collect()
}

/// Select the removal set: half the safe candidates, oldest first, whole
/// pair groups pulled in atomically.
pub fn select_removals(conversation: &Conversation) -> BTreeSet<usize> {
    let safe = safe_candidates(conversation);
    let target = safe.len() / 2;
    let mut removal: BTreeSet<usize> = BTreeSet::new();

    for &index in &safe {
        if removal.len() >= target {
            break;
        }
        if removal.contains(&index) {
            continue;
        }
        if conversation.is_unpaired(index) {
            removal.insert(index);
        } else {
            removal.extend(conversation.pair_group_of(index));
        }
    }

    removal
}

/// Apply a compaction pass to the conversation.
pub fn compact_conversation(conversation: &mut Conversation) -> CompactionOutcome {
    let removal = select_removals(conversation);
    if removal.is_empty() {
        return CompactionOutcome::default();
    }

    let mut log = Vec::new();
    for &i in &removal {
        if let Some(msg) = conversation.get(i) {
            log.push(format!("removed message {} (index {i})", msg.id));
        }
    }

    let outcome = conversation.remove_indices(&removal);
    debug!(
        removed = outcome.removed,
        tokens_freed = outcome.tokens_freed,
        "conversation compacted"
    );

    CompactionOutcome {
        removed: outcome.removed,
        tokens_freed: outcome.tokens_freed,
        removed_indices: removal,
        log,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{ContentPart, Message};
    use serde_json::json;

    fn tool_use(id: &str, name: &str, input: serde_json::Value) -> ContentPart {
        ContentPart::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    fn tool_result(id: &str, content: &str) -> ContentPart {
        ContentPart::ToolResult {
            tool_use_id: id.into(),
            content: content.into(),
            error: None,
        }
    }

    /// The pair-integrity scenario: two tool pairs, protected tail at 6.
    fn seeded_conversation() -> Conversation {
        let mut conv = Conversation::new();
        conv.push(Message::user_text("hi")); // 0
        conv.push(Message::assistant(vec![tool_use("t1", "search", json!({"q": "x"}))])); // 1
        conv.push(Message::tool_results(vec![tool_result("t1", &"long…".repeat(50))])); // 2
        conv.push(Message::user_text("q2")); // 3
        conv.push(Message::assistant(vec![tool_use("t2", "fetch", json!({"u": "U"}))])); // 4
        conv.push(Message::tool_results(vec![tool_result("t2", "body…")])); // 5
        conv.protect_tail(); // boundary = 6
        conv.push(Message::user_text("now summarize")); // 6
        conv
    }

    #[test]
    fn pairs_survive_or_die_together() {
        let mut conv = seeded_conversation();
        assert_eq!(conv.protected_from_index(), 6);

        let outcome = compact_conversation(&mut conv);
        assert!(outcome.removed > 0);

        // No lone tool_use or tool_result anywhere.
        assert!(conv.dangling_ids().is_empty());
        let pairs = conv.pair_locations();
        for (_, (_, result)) in pairs {
            assert!(result.is_some(), "no dangling tool_use either");
        }

        // Each original pair either fully present or fully gone.
        for id in ["t1", "t2"] {
            let use_present = conv
                .messages()
                .iter()
                .any(|m| m.tool_use_ids().contains(&id));
            let result_present = conv
                .messages()
                .iter()
                .any(|m| m.tool_result_ids().contains(&id));
            assert_eq!(use_present, result_present, "pair {id} split");
        }

        // Oldest-first with target = floor(6/2): "hi" and the t1 pair go,
        // the t2 pair and the protected tail stay.
        assert_eq!(conv.len(), 4);
        assert!(conv.pair_locations().contains_key("t2"));
        let last = conv.messages().last().unwrap();
        assert_eq!(last.text(), "now summarize");
    }

    #[test]
    fn protected_pair_partner_is_never_removed() {
        // The t2 pair straddles the boundary: use at 4, result at 5,
        // boundary at 5. Index 4 is unsafe because its group reaches 5.
        let mut conv = Conversation::new();
        conv.push(Message::user_text("hi"));
        conv.push(Message::assistant(vec![tool_use("t1", "a", json!({}))]));
        conv.push(Message::tool_results(vec![tool_result("t1", "r1")]));
        conv.push(Message::user_text("more"));
        conv.push(Message::assistant(vec![tool_use("t2", "b", json!({}))]));
        conv.protect_tail(); // boundary = 5
        conv.push(Message::tool_results(vec![tool_result("t2", "r2")]));

        let safe = safe_candidates(&conv);
        assert!(!safe.contains(&4), "t2's use is protected by its result");
        assert!(safe.contains(&1) && safe.contains(&2));

        compact_conversation(&mut conv);
        assert!(conv.dangling_ids().is_empty());
        let pairs = conv.pair_locations();
        assert!(pairs.contains_key("t2"), "straddling pair intact");
    }

    #[test]
    fn removal_targets_half_oldest_first() {
        let mut conv = Conversation::new();
        for i in 0..8 {
            conv.push(Message::user_text(format!("m{i}")));
        }
        conv.protect_tail();

        let removal = select_removals(&conv);
        assert_eq!(removal, BTreeSet::from([0, 1, 2, 3]));
    }

    #[test]
    fn empty_and_fully_protected_conversations_are_noops() {
        let mut conv = Conversation::new();
        assert_eq!(compact_conversation(&mut conv).removed, 0);

        conv.push(Message::user_text("a"));
        // protected_from_index still 0: everything is in-flight.
        assert_eq!(compact_conversation(&mut conv).removed, 0);
        assert_eq!(conv.len(), 1);
    }

    #[test]
    fn pair_integrity_holds_over_generated_conversations() {
        // Deterministic LCG so failures reproduce; every generated shape
        // must survive repeated compaction with no pair ever split.
        let mut state: u64 = 0x5eed;
        let mut next = move |bound: u64| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) % bound
        };

        for round in 0..50 {
            let mut conv = Conversation::new();
            let mut tool_seq = 0;
            let messages = 3 + next(10) as usize;

            for _ in 0..messages {
                match next(3) {
                    0 => {
                        conv.push(Message::user_text(format!("note {}", next(1000))));
                    }
                    1 => {
                        let id = format!("r{round}_t{tool_seq}");
                        tool_seq += 1;
                        conv.push(Message::assistant(vec![tool_use(&id, "search", json!({}))]));
                        conv.push(Message::tool_results(vec![tool_result(&id, "result")]));
                    }
                    _ => {
                        // Two uses in one assistant message, results split
                        // across two user messages.
                        let a = format!("r{round}_t{tool_seq}");
                        let b = format!("r{round}_t{}", tool_seq + 1);
                        tool_seq += 2;
                        conv.push(Message::assistant(vec![
                            tool_use(&a, "search", json!({})),
                            tool_use(&b, "fetch", json!({})),
                        ]));
                        conv.push(Message::tool_results(vec![tool_result(&a, "ra")]));
                        conv.push(Message::tool_results(vec![tool_result(&b, "rb")]));
                    }
                }
            }

            // Protect a random tail, then compact until nothing moves.
            let boundary = next(conv.len() as u64 + 1) as usize;
            let mut staged = Conversation::new();
            for (i, msg) in conv.messages().iter().enumerate() {
                if i == boundary {
                    staged.protect_tail();
                }
                staged.push(msg.clone());
            }
            if boundary >= staged.len() {
                staged.protect_tail();
            }
            let mut conv = staged;

            loop {
                let protected_tail: Vec<String> = conv.messages()
                    [conv.protected_from_index()..]
                    .iter()
                    .map(|m| m.id.clone())
                    .collect();
                let outcome = compact_conversation(&mut conv);

                assert!(
                    conv.dangling_ids().is_empty(),
                    "round {round}: dangling result after compaction"
                );
                for (_, (_, result)) in conv.pair_locations() {
                    assert!(result.is_some(), "round {round}: dangling tool_use");
                }
                let surviving: Vec<String> = conv.messages()
                    [conv.protected_from_index()..]
                    .iter()
                    .map(|m| m.id.clone())
                    .collect();
                assert_eq!(protected_tail, surviving, "round {round}: protected tail changed");
                assert!(conv.protected_from_index() <= conv.len());

                if outcome.removed == 0 {
                    break;
                }
            }
        }
    }

    #[test]
    fn group_pulled_in_atomically_may_exceed_target() {
        // One unpaired message and one three-message group. Target is 2
        // (floor 4/2); selecting the group adds all three at once.
        let mut conv = Conversation::new();
        conv.push(Message::user_text("old")); // 0
        conv.push(Message::assistant(vec![
            tool_use("a", "x", json!({})),
            tool_use("b", "y", json!({})),
        ])); // 1
        conv.push(Message::tool_results(vec![tool_result("a", "ra")])); // 2
        conv.push(Message::tool_results(vec![tool_result("b", "rb")])); // 3
        conv.protect_tail();

        let removal = select_removals(&conv);
        // 0 first, then the whole group {1,2,3}.
        assert_eq!(removal, BTreeSet::from([0, 1, 2, 3]));

        compact_conversation(&mut conv);
        assert!(conv.dangling_ids().is_empty());
        assert_eq!(conv.len(), 0);
    }
}
