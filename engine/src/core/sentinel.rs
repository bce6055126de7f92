//! Detect the literal sentinels an agent turn's response is scanned for.
//!
//! Pure regex/string matching over a response body; no knowledge of the
//! conversation or plan it came from.

use std::sync::OnceLock;

use regex::Regex;

const GOAL_COMPLETION_PHRASES: &[&str] = &[
    "task complete",
    "goal achieved",
    "all goals met",
    "successfully completed all",
    "finished all",
    "all sub-goals complete",
];

fn step_complete_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)STEP\s+COMPLETE").expect("valid regex"))
}

fn step_blocked_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?im)STEP\s+BLOCKED[:\s]*(.+?)$").expect("valid regex"))
}

fn progress_100_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"100%").expect("valid regex"))
}

pub fn is_step_complete(response: &str) -> bool {
    step_complete_re().is_match(response)
}

/// Returns the blocked reason captured after `STEP BLOCKED:`, if present.
pub fn step_blocked_reason(response: &str) -> Option<String> {
    step_blocked_re()
        .captures(response)
        .map(|c| c[1].trim().to_string())
}

/// A goal-completion signal: one of the phrase set, or an explicit `100%`
/// progress indicator.
pub fn is_goal_completion_signal(response: &str) -> bool {
    let lowered = response.to_ascii_lowercase();
    GOAL_COMPLETION_PHRASES.iter().any(|p| lowered.contains(p)) || progress_100_re().is_match(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_complete_matches_case_and_whitespace_insensitively() {
        assert!(is_step_complete("step   complete"));
        assert!(is_step_complete("Work done.\nSTEP COMPLETE\n"));
        assert!(!is_step_complete("the step is not complete yet"));
    }

    #[test]
    fn step_blocked_captures_the_reason() {
        let reason = step_blocked_reason("STEP BLOCKED: missing API credentials");
        assert_eq!(reason.as_deref(), Some("missing API credentials"));
    }

    #[test]
    fn step_blocked_reason_is_none_when_absent() {
        assert_eq!(step_blocked_reason("everything is fine"), None);
    }

    #[test]
    fn goal_completion_phrases_are_case_insensitive() {
        assert!(is_goal_completion_signal("TASK COMPLETE. All done."));
        assert!(is_goal_completion_signal("We have finished all requested work."));
        assert!(!is_goal_completion_signal("still working on it"));
    }

    #[test]
    fn explicit_100_percent_is_an_equivalent_signal() {
        assert!(is_goal_completion_signal("Progress: 100% done."));
    }
}
