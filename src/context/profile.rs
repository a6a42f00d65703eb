//! Task-type priority profiles: which components give way first under
//! budget pressure, plus the short preamble spliced into the system
//! prompt. Detection is pure regex over a plan goal — no model call.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Research,
    Coding,
    Analysis,
    General,
}

impl Default for TaskType {
    fn default() -> Self {
        Self::General
    }
}

fn research_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(research|investigate|find out|look up|survey|compare|competitor|sources?|summari[sz]e findings)\b")
            .expect("profile pattern must compile")
    })
}

fn coding_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(implement|refactor|fix|debug|code|compile|test suite|function|bug|patch|library|api endpoint)\b")
            .expect("profile pattern must compile")
    })
}

fn analysis_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(analy[sz]e|evaluate|assess|measure|metrics|statistics|breakdown|trend)\b")
            .expect("profile pattern must compile")
    })
}

/// Classify a plan goal. First match wins: research, then coding, then
/// analysis; anything else is general.
pub fn detect_task_type(goal: &str) -> TaskType {
    if research_re().is_match(goal) {
        TaskType::Research
    } else if coding_re().is_match(goal) {
        TaskType::Coding
    } else if analysis_re().is_match(goal) {
        TaskType::Analysis
    } else {
        TaskType::General
    }
}

/// Compaction priorities (higher = compact sooner) and the system-prompt
/// preamble for one task type.
#[derive(Debug, Clone)]
pub struct PriorityProfile {
    pub task_type: TaskType,
    priorities: BTreeMap<&'static str, u32>,
}

impl PriorityProfile {
    pub fn for_task_type(task_type: TaskType) -> Self {
        let priorities: &[(&'static str, u32)] = match task_type {
            // Research hoards distilled knowledge: the memory index is
            // nearly last to shrink, the conversation goes first.
            TaskType::Research => &[
                ("memory_index", 3),
                ("recent_tool_outputs", 5),
                ("conversation_history", 10),
            ],
            // Coding leans on the recent conversation (diffs, error
            // output); stale tool outputs give way first.
            TaskType::Coding => &[
                ("memory_index", 6),
                ("recent_tool_outputs", 10),
                ("conversation_history", 4),
            ],
            TaskType::Analysis => &[
                ("memory_index", 4),
                ("recent_tool_outputs", 8),
                ("conversation_history", 9),
            ],
            TaskType::General => &[
                ("memory_index", 5),
                ("recent_tool_outputs", 9),
                ("conversation_history", 8),
            ],
        };
        Self {
            task_type,
            priorities: priorities.iter().copied().collect(),
        }
    }

    pub fn detect(goal: &str) -> Self {
        Self::for_task_type(detect_task_type(goal))
    }

    /// Compaction priority for a named component. Unknown components get a
    /// middling default so plugins participate without registration.
    pub fn priority_of(&self, component: &str) -> u32 {
        self.priorities.get(component).copied().unwrap_or(7)
    }

    /// Preamble spliced into the system prompt. The memory-less variant is
    /// used when the working-memory feature is off.
    pub fn preamble(&self, memory_enabled: bool) -> &'static str {
        match (self.task_type, memory_enabled) {
            (TaskType::Research, true) => {
                "Task mode: research. Store source material under raw.* keys, distill \
                 into findings.* as you go, and cite memory keys when summarizing."
            }
            (TaskType::Research, false) => {
                "Task mode: research. Summarize sources as you read them; carry only \
                 conclusions forward in the conversation."
            }
            (TaskType::Coding, true) => {
                "Task mode: coding. Keep error output and diffs in the conversation; \
                 park reference material in working memory."
            }
            (TaskType::Coding, false) => {
                "Task mode: coding. Keep error output and diffs close; re-read files \
                 instead of trusting stale excerpts."
            }
            (TaskType::Analysis, true) => {
                "Task mode: analysis. Record intermediate figures under findings.* keys \
                 so later steps can build on them."
            }
            (TaskType::Analysis, false) => {
                "Task mode: analysis. State intermediate figures explicitly before \
                 moving on; they will not be recoverable later."
            }
            (TaskType::General, true) => {
                "Use working memory for anything worth keeping beyond the next few turns."
            }
            (TaskType::General, false) => "",
        }
    }
}

impl Default for PriorityProfile {
    fn default() -> Self {
        Self::for_task_type(TaskType::General)
    }
}
