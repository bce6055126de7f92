//! Pure escalation-ladder logic for the Supervisor's `Check` operation,
//! plus tolerant parsing of the supervisor agent's structured responses.
//!
//! The agent calls themselves live in the `io`-level supervisor wrapper;
//! this module only turns a `(score, consecutive_issues)` pair into an
//! [`Action`] via an exhaustive, order-sensitive match, and turns a raw
//! agent response into the typed records below — no agent calls, no
//! cache, no clock.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::tri::{Confidence, Tri};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Continue,
    Remind,
    Correct,
    Refocus,
    Critical,
    Abort,
}

/// Escalate based on the worker-turn `score` (0-100, higher is better) and
/// the monotonic `consecutive_issues` counter (reset to 0 on `Continue`).
///
/// Consecutive-issue bands take priority over the score band: a
/// recovering score does not undo a run of prior issues until the caller
/// resets the counter on the next `Continue`.
pub fn escalate(score: u8, consecutive_issues: u32) -> Action {
    if consecutive_issues >= 5 {
        return Action::Abort;
    }
    if consecutive_issues >= 4 {
        return Action::Critical;
    }
    if score < 30 || consecutive_issues >= 3 {
        return Action::Refocus;
    }
    if (30..50).contains(&score) || consecutive_issues >= 2 {
        return Action::Correct;
    }
    if (50..70).contains(&score) {
        return Action::Remind;
    }
    Action::Continue
}

/// Whether `action` should reset the caller's `consecutive_issues` counter.
pub fn resets_consecutive_issues(action: Action) -> bool {
    matches!(action, Action::Continue)
}

/// Supervisor output for a single worker-turn `Check`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assessment {
    pub score: u8,
    pub action: Action,
    pub reason: Option<String>,
    /// Optional coaching message to fold into the next follow-up prompt.
    pub prompt: Option<String>,
}

/// `ReviewPlan` output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanReview {
    pub approved: bool,
    pub issues: Vec<String>,
    pub missing_steps: Vec<String>,
    pub suggestions: Vec<String>,
}

/// `VerifyStepCompletion` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepVerification {
    pub verified: bool,
    pub reason: Option<String>,
}

/// `VerifyGoalAchieved` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalVerification {
    pub achieved: Tri,
    pub confidence: Confidence,
    pub gaps: Vec<String>,
    pub recommendation: Option<String>,
    pub reason: Option<String>,
}

/// Find the first top-level `{...}` object in `raw`, tolerating prose
/// before/after it (agents routinely wrap JSON in commentary).
fn extract_json_object(raw: &str) -> Option<Value> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&raw[start..=end]).ok()
}

fn as_str_vec(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

/// Parse a `(score, reason, coaching prompt)` triple from the supervisor
/// agent's raw response. Falls back to a lenient default (score 70, no
/// reason) when no JSON object is present — bulletproofing means a
/// malformed supervisor response must never block the run.
pub fn parse_score_and_reason(raw: &str) -> (u8, Option<String>, Option<String>) {
    let Some(json) = extract_json_object(raw) else {
        return (70, None, None);
    };
    let score = json
        .get("score")
        .and_then(Value::as_f64)
        .map(|s| s.clamp(0.0, 100.0) as u8)
        .unwrap_or(70);
    let reason = json.get("reason").and_then(Value::as_str).map(str::to_string);
    let prompt = json.get("prompt").and_then(Value::as_str).map(str::to_string);
    (score, reason, prompt)
}

/// Parse `ReviewPlan`'s structured response, defaulting to an approved
/// plan with no issues when the agent's response doesn't parse — a plan
/// review that can't be understood must never block execution.
pub fn parse_plan_review(raw: &str) -> PlanReview {
    let Some(json) = extract_json_object(raw) else {
        return PlanReview {
            approved: true,
            ..PlanReview::default()
        };
    };
    PlanReview {
        approved: json.get("approved").and_then(Value::as_bool).unwrap_or(true),
        issues: as_str_vec(json.get("issues")),
        missing_steps: as_str_vec(json.get("missing_steps")),
        suggestions: as_str_vec(json.get("suggestions")),
    }
}

/// Parse `VerifyStepCompletion`'s structured response. Defaults to
/// unverified (the Executor treats this as a rejection, not a crash) when
/// the response doesn't parse.
pub fn parse_step_verification(raw: &str) -> StepVerification {
    let Some(json) = extract_json_object(raw) else {
        return StepVerification {
            verified: false,
            reason: Some("supervisor response did not contain a parseable verdict".to_string()),
        };
    };
    StepVerification {
        verified: json.get("verified").and_then(Value::as_bool).unwrap_or(false),
        reason: json.get("reason").and_then(Value::as_str).map(str::to_string),
    }
}

/// Parse `VerifyGoalAchieved`'s structured response. Defaults to
/// `Partial`/`Low` (inconclusive) when the response doesn't parse, per
/// the tri-valued-boolean design note: unparseable input is inconclusive,
/// never a hard failure.
pub fn parse_goal_verification(raw: &str) -> GoalVerification {
    let Some(json) = extract_json_object(raw) else {
        return GoalVerification {
            achieved: Tri::Partial,
            confidence: Confidence::Low,
            gaps: Vec::new(),
            recommendation: None,
            reason: Some("unparseable supervisor response".to_string()),
        };
    };
    let achieved = json.get("achieved").map(Tri::from_loose).unwrap_or(Tri::Partial);
    let confidence = match json.get("confidence").and_then(Value::as_str).map(str::to_ascii_uppercase).as_deref() {
        Some("HIGH") => Confidence::High,
        Some("MEDIUM") => Confidence::Medium,
        _ => Confidence::Low,
    };
    GoalVerification {
        achieved,
        confidence,
        gaps: as_str_vec(json.get("gaps")),
        recommendation: json.get("recommendation").and_then(Value::as_str).map(str::to_string),
        reason: json.get("reason").and_then(Value::as_str).map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_score_with_no_issue_history_continues() {
        assert_eq!(escalate(100, 0), Action::Continue);
        assert_eq!(escalate(70, 0), Action::Continue);
    }

    #[test]
    fn score_band_boundary_69_70() {
        assert_eq!(escalate(69, 0), Action::Remind);
        assert_eq!(escalate(70, 0), Action::Continue);
    }

    #[test]
    fn score_band_boundary_49_50() {
        assert_eq!(escalate(49, 0), Action::Correct);
        assert_eq!(escalate(50, 0), Action::Remind);
    }

    #[test]
    fn score_band_boundary_29_30() {
        assert_eq!(escalate(29, 0), Action::Refocus);
        assert_eq!(escalate(30, 0), Action::Correct);
    }

    #[test]
    fn consecutive_issues_escalate_even_with_a_recovering_score() {
        assert_eq!(escalate(90, 2), Action::Correct);
        assert_eq!(escalate(90, 3), Action::Refocus);
        assert_eq!(escalate(90, 4), Action::Critical);
        assert_eq!(escalate(90, 5), Action::Abort);
    }

    #[test]
    fn abort_outranks_every_other_band() {
        assert_eq!(escalate(0, 5), Action::Abort);
        assert_eq!(escalate(100, 5), Action::Abort);
    }

    #[test]
    fn continue_is_the_only_action_that_resets_the_counter() {
        assert!(resets_consecutive_issues(Action::Continue));
        assert!(!resets_consecutive_issues(Action::Remind));
        assert!(!resets_consecutive_issues(Action::Abort));
    }

    #[test]
    fn parse_score_and_reason_reads_a_clean_json_object() {
        let raw = r#"{"score": 42, "reason": "drifted off task", "prompt": "refocus on step 2"}"#;
        assert_eq!(
            parse_score_and_reason(raw),
            (42, Some("drifted off task".to_string()), Some("refocus on step 2".to_string()))
        );
    }

    #[test]
    fn parse_score_and_reason_tolerates_surrounding_prose() {
        let raw = "Here's my assessment:\n{\"score\": 15}\nThat's my call.";
        assert_eq!(parse_score_and_reason(raw), (15, None, None));
    }

    #[test]
    fn parse_score_and_reason_clamps_out_of_range_scores() {
        assert_eq!(parse_score_and_reason(r#"{"score": 250}"#).0, 100);
    }

    #[test]
    fn parse_score_and_reason_defaults_leniently_on_garbage() {
        assert_eq!(parse_score_and_reason("not json at all"), (70, None, None));
    }

    #[test]
    fn parse_plan_review_reads_rejection_with_issues() {
        let raw = r#"{"approved": false, "issues": ["step 3 has no test"], "missing_steps": ["add migration"], "suggestions": []}"#;
        let review = parse_plan_review(raw);
        assert!(!review.approved);
        assert_eq!(review.issues, vec!["step 3 has no test".to_string()]);
        assert_eq!(review.missing_steps, vec!["add migration".to_string()]);
    }

    #[test]
    fn parse_plan_review_defaults_to_approved_on_garbage() {
        assert!(parse_plan_review("garbled").approved);
    }

    #[test]
    fn parse_step_verification_reads_verified_true() {
        let v = parse_step_verification(r#"{"verified": true}"#);
        assert!(v.verified);
        assert!(v.reason.is_none());
    }

    #[test]
    fn parse_step_verification_defaults_to_unverified_on_garbage() {
        let v = parse_step_verification("no json here");
        assert!(!v.verified);
        assert!(v.reason.is_some());
    }

    #[test]
    fn parse_goal_verification_reads_full_record() {
        let raw = r#"{"achieved": "PARTIAL", "confidence": "HIGH", "gaps": ["missing tests"], "recommendation": "add coverage"}"#;
        let gv = parse_goal_verification(raw);
        assert_eq!(gv.achieved, Tri::Partial);
        assert_eq!(gv.confidence, Confidence::High);
        assert_eq!(gv.gaps, vec!["missing tests".to_string()]);
    }

    #[test]
    fn parse_goal_verification_accepts_bool_achieved() {
        let gv = parse_goal_verification(r#"{"achieved": true, "confidence": "MEDIUM"}"#);
        assert_eq!(gv.achieved, Tri::Yes);
        assert_eq!(gv.confidence, Confidence::Medium);
    }

    #[test]
    fn parse_goal_verification_defaults_to_inconclusive_on_garbage() {
        let gv = parse_goal_verification("not parseable");
        assert_eq!(gv.achieved, Tri::Partial);
        assert_eq!(gv.confidence, Confidence::Low);
    }
}
