//! User-intent classification. Pure regex heuristics over the input
//! string — no model call, same input always classifies the same way.

use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Simple,
    Complex,
    Approval,
    Rejection,
    StatusQuery,
    Interrupt,
    Feedback,
    PlanModify,
}

fn re(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("intent pattern must compile"))
}

fn interrupt_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(
        &RE,
        r"(?i)^\s*(stop|wait|hold on|hold up|pause|abort|halt)\b",
    )
}

fn approval_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(
        &RE,
        r"(?i)^\s*(yes|yep|yeah|ok(ay)?|sure|sounds good|approved?|go ahead|proceed|lgtm|looks good|do it|ship it)\b",
    )
}

fn rejection_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(
        &RE,
        r"(?i)^\s*(no\b|nope|nah|rejected?|don'?t\b|do not\b|cancel\b|scrap (that|the plan)|start over)",
    )
}

fn status_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(
        &RE,
        r"(?i)(\bstatus\b|\bprogress\b|how('s| is) it going|where are (we|you)|are you done|what('s| is) (left|remaining|next))",
    )
}

fn plan_modify_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(
        &RE,
        r"(?i)\b(add|remove|drop|reorder|swap|change|modify|update|edit)\b.{0,40}\b(step|task|plan)\b",
    )
}

fn feedback_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(
        &RE,
        r"(?i)(^\s*(actually|instead|rather)\b|next time\b|that('s| is| was) (wrong|not right|not what)|i('d| would) prefer)",
    )
}

fn complex_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(
        &RE,
        r"(?i)(\bthen\b|\bafter that\b|\bfollowed by\b|\bstep by step\b|\b(research|implement|build|refactor|analy[sz]e|investigate|migrate|design)\b.*\band\b)",
    )
}

/// Classify a raw user input. Checks run in precedence order; the first
/// match wins. Anything long or multi-step falls into `Complex`, the rest
/// is `Simple`.
pub fn classify(input: &str) -> Intent {
    let trimmed = input.trim();
    if interrupt_re().is_match(trimmed) {
        return Intent::Interrupt;
    }
    if approval_re().is_match(trimmed) {
        return Intent::Approval;
    }
    if rejection_re().is_match(trimmed) {
        return Intent::Rejection;
    }
    if status_re().is_match(trimmed) {
        return Intent::StatusQuery;
    }
    if plan_modify_re().is_match(trimmed) {
        return Intent::PlanModify;
    }
    if feedback_re().is_match(trimmed) {
        return Intent::Feedback;
    }
    if complex_re().is_match(trimmed) || trimmed.len() > 280 {
        return Intent::Complex;
    }
    Intent::Simple
}
