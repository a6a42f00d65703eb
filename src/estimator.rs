//! Character-ratio token estimation. Deliberately over-estimates — exact
//! tokenizer agreement is a non-goal; trend detection is the point.

use serde_json::Value;

/// What kind of text is being estimated. Code packs more tokens per
/// character than prose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Code,
    Prose,
    Mixed,
}

impl ContentKind {
    fn chars_per_token(self) -> f64 {
        match self {
            ContentKind::Code => 3.0,
            ContentKind::Prose => 4.0,
            ContentKind::Mixed => 3.5,
        }
    }
}

/// Estimate tokens for a string: `ceil(len / ratio)`.
pub fn estimate(text: &str, kind: ContentKind) -> u32 {
    (text.len() as f64 / kind.chars_per_token()).ceil() as u32
}

/// Estimate tokens for structured data. Serializes to JSON first.
pub fn estimate_json(value: &Value, kind: ContentKind) -> u32 {
    estimate(&value.to_string(), kind)
}

/// Estimate tokens for a byte count alone, when the text is gone.
pub fn estimate_bytes(len: usize, kind: ContentKind) -> u32 {
    (len as f64 / kind.chars_per_token()).ceil() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prose_is_chars_over_four() {
        assert_eq!(estimate("hello world!", ContentKind::Prose), 3); // 12 / 4
        assert_eq!(estimate("", ContentKind::Prose), 0);
        let s = "a".repeat(400);
        assert_eq!(estimate(&s, ContentKind::Prose), 100);
    }

    #[test]
    fn code_is_denser_than_prose() {
        let s = "fn main() { println!(\"hi\"); }";
        assert!(estimate(s, ContentKind::Code) > estimate(s, ContentKind::Prose));
    }

    #[test]
    fn rounds_up() {
        // 5 chars / 4 = 1.25 -> 2
        assert_eq!(estimate("abcde", ContentKind::Prose), 2);
        // 7 chars / 3.5 = 2.0 -> 2
        assert_eq!(estimate("abcdefg", ContentKind::Mixed), 2);
    }

    #[test]
    fn json_serializes_first() {
        let v = json!({"role": "user", "content": "hello"});
        let tokens = estimate_json(&v, ContentKind::Mixed);
        assert!(tokens > estimate("hello", ContentKind::Mixed));
    }
}
