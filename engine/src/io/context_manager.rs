//! Smart context assembly: turns session state into a single prompt for
//! the worker agent, keeping it inside a token budget.
//!
//! Structurally modeled on the teacher's `io/prompt.rs`: a fixed ordered
//! list of named sections, some required and some droppable, assembled
//! into one string and then trimmed to budget by dropping droppable
//! sections in a fixed priority order before finally hard-truncating
//! whatever remains. This module additionally tracks a bounded window of
//! recent response hashes to flag duplicate agent output, a concern the
//! teacher's prompt assembly doesn't have (there's no worker-turn loop to
//! get stuck in).

use std::collections::VecDeque;

use crate::core::context_score::{Message, compress_history, filter_by_importance};
use crate::core::types::{Plan, Step};

/// One named slice of the assembled prompt.
#[derive(Debug, Clone)]
struct Section {
    name: &'static str,
    content: String,
    required: bool,
}

impl Section {
    fn render_len(&self) -> usize {
        self.content.len()
    }
}

/// Fixed drop order for droppable sections when the assembled prompt
/// exceeds budget. Earlier entries are dropped first.
const DROP_ORDER: &[&str] = &["recent_decisions", "progress_summary", "history"];

const TRUNCATION_MARKER: &str = "\n[...truncated...]\n";

/// Everything the ContextManager needs to assemble one worker-turn prompt.
pub struct ContextInputs<'a> {
    pub goal: &'a str,
    pub plan: &'a Plan,
    pub current_step: Option<&'a Step>,
    pub recent_decisions: &'a [String],
    pub history: &'a [Message],
}

/// The assembled prompt plus which droppable sections survived, so a
/// caller can log what was sacrificed to stay in budget.
pub struct ContextPack {
    pub prompt: String,
    pub dropped_sections: Vec<&'static str>,
}

fn render(sections: &[Section]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_len(sections: &[Section]) -> usize {
    if sections.is_empty() {
        return 0;
    }
    sections.iter().map(Section::render_len).sum::<usize>() + (sections.len() - 1) * 2
}

fn progress_summary(plan: &Plan) -> String {
    let completed = plan.steps.iter().filter(|s| s.status == crate::core::types::StepStatus::Completed).count();
    format!("PROGRESS: {completed}/{} steps completed", plan.total_steps())
}

fn current_step_section(step: Option<&Step>) -> String {
    match step {
        Some(step) => format!("CURRENT STEP {}: {}", step.number, step.description),
        None => "CURRENT STEP: none (plan complete or no leaf ready)".to_string(),
    }
}

fn history_section(history: &[Message], keep_recent: usize, budget_tokens: u32) -> String {
    let compressed = compress_history(history, keep_recent);
    let filtered = filter_by_importance(&compressed, budget_tokens);
    filtered
        .iter()
        .map(|m| format!("{:?}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Assemble a worker-turn prompt from `inputs`, dropping droppable
/// sections in fixed priority order and finally hard-truncating until the
/// rendered prompt fits within `budget_chars` (an approximation of a
/// token budget; four characters per token matches
/// [`Message::approx_tokens`]).
pub fn assemble(inputs: &ContextInputs, budget_chars: usize, history_keep_recent: usize, history_token_budget: u32) -> ContextPack {
    let mut sections = vec![
        Section {
            name: "goal",
            content: format!("GOAL: {}", inputs.goal),
            required: true,
        },
        Section {
            name: "current_step",
            content: current_step_section(inputs.current_step),
            required: true,
        },
        Section {
            name: "progress_summary",
            content: progress_summary(inputs.plan),
            required: false,
        },
        Section {
            name: "recent_decisions",
            content: if inputs.recent_decisions.is_empty() {
                String::new()
            } else {
                format!("RECENT DECISIONS:\n{}", inputs.recent_decisions.join("\n"))
            },
            required: false,
        },
        Section {
            name: "history",
            content: if inputs.history.is_empty() {
                String::new()
            } else {
                format!("HISTORY:\n{}", history_section(inputs.history, history_keep_recent, history_token_budget))
            },
            required: false,
        },
    ];
    sections.retain(|s| s.required || !s.content.is_empty());

    let mut dropped_sections = Vec::new();
    for name in DROP_ORDER {
        if render_len(&sections) <= budget_chars {
            break;
        }
        if let Some(pos) = sections.iter().position(|s| &s.name == name) {
            sections.remove(pos);
            dropped_sections.push(*name);
        }
    }

    let mut prompt = render(&sections);
    if prompt.len() > budget_chars {
        let keep = budget_chars.saturating_sub(TRUNCATION_MARKER.len());
        let cut = floor_char_boundary(&prompt, keep);
        prompt.truncate(cut);
        prompt.push_str(TRUNCATION_MARKER);
    }

    ContextPack {
        prompt,
        dropped_sections,
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Bounded window of recent agent-response hashes, used to detect the
/// worker repeating itself verbatim turn over turn.
pub struct DuplicateDetector {
    window: VecDeque<u64>,
    capacity: usize,
}

impl DuplicateDetector {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn hash_of(response: &str) -> u64 {
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in response.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x100000001b3);
        }
        hash
    }

    /// Record `response` and report whether it duplicates any response
    /// still in the window.
    pub fn observe(&mut self, response: &str) -> bool {
        let hash = Self::hash_of(response);
        let is_duplicate = self.window.contains(&hash);
        self.window.push_back(hash);
        if self.window.len() > self.capacity {
            self.window.pop_front();
        }
        is_duplicate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context_score::Role;
    use crate::core::types::{Complexity, Plan, Step};

    fn sample_plan() -> Plan {
        Plan {
            analysis: "analysis".to_string(),
            steps: vec![Step::new("1", "do the thing", Complexity::Simple)],
            next_sequence: 2,
        }
    }

    #[test]
    fn assembles_all_sections_when_budget_is_generous() {
        let plan = sample_plan();
        let step = plan.find("1");
        let decisions = vec!["chose postgres".to_string()];
        let history = vec![Message {
            role: Role::Assistant,
            content: "did some work".to_string(),
        }];
        let inputs = ContextInputs {
            goal: "build a thing",
            plan: &plan,
            current_step: step,
            recent_decisions: &decisions,
            history: &history,
        };
        let pack = assemble(&inputs, 10_000, 6, 8_000);
        assert!(pack.prompt.contains("GOAL: build a thing"));
        assert!(pack.prompt.contains("CURRENT STEP 1"));
        assert!(pack.prompt.contains("chose postgres"));
        assert!(pack.dropped_sections.is_empty());
    }

    #[test]
    fn drops_droppable_sections_in_fixed_order_under_tight_budget() {
        let plan = sample_plan();
        let decisions = vec!["a decision".to_string()];
        let history = vec![Message {
            role: Role::Assistant,
            content: "some history content that takes up space".to_string(),
        }];
        let inputs = ContextInputs {
            goal: "build a thing",
            plan: &plan,
            current_step: plan.find("1"),
            recent_decisions: &decisions,
            history: &history,
        };
        let pack = assemble(&inputs, 60, 6, 8_000);
        assert!(pack.prompt.contains("GOAL"));
        assert!(pack.dropped_sections.contains(&"recent_decisions") || pack.dropped_sections.contains(&"history"));
    }

    #[test]
    fn required_sections_survive_even_an_impossible_budget() {
        let plan = sample_plan();
        let inputs = ContextInputs {
            goal: "build a thing",
            plan: &plan,
            current_step: plan.find("1"),
            recent_decisions: &[],
            history: &[],
        };
        let pack = assemble(&inputs, 5, 6, 8_000);
        assert!(pack.prompt.contains("GOAL") || pack.prompt.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn duplicate_detector_flags_repeated_responses() {
        let mut detector = DuplicateDetector::new(3);
        assert!(!detector.observe("first response"));
        assert!(!detector.observe("second response"));
        assert!(detector.observe("first response"));
    }

    #[test]
    fn duplicate_detector_forgets_beyond_its_window() {
        let mut detector = DuplicateDetector::new(2);
        detector.observe("a");
        detector.observe("b");
        detector.observe("c");
        assert!(!detector.observe("a"));
    }
}
