//! Supervisor: a second agent conversation that watches the worker.
//!
//! Thin orchestration over [`crate::core::supervisor`]'s pure parsing and
//! escalation logic: each public operation here builds a prompt, drives
//! one turn of an [`AgentDriver`], and hands the raw response to the
//! matching `parse_*` function. Assessment results for `check` are cached
//! by a content hash of `(step_number, worker_response)` so an unchanged
//! worker turn doesn't re-spend a supervisor call — the same bulletproof
//! intuition as the teacher's guard-skip-unless-`Done` check, generalized
//! to a TTL cache since here the "skip" condition is "we've already
//! assessed this exact input recently" rather than a single status flag.

use crate::core::supervisor::{Action, Assessment, GoalVerification, PlanReview, StepVerification, escalate, parse_goal_verification, parse_plan_review, parse_score_and_reason, parse_step_verification};
use crate::core::types::Plan;
use crate::io::agent_driver::AgentDriver;
use crate::io::persistence::TtlCache;
use crate::io::schema::{SchemaKind, validate_response};

fn hash_key(parts: &[&str]) -> String {
    let mut hash: u64 = 0xcbf29ce484222325;
    for part in parts {
        for byte in part.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x100000001b3);
        }
        hash ^= 0xff;
    }
    format!("{hash:x}")
}

/// Assess one worker turn, escalating per [`escalate`]. Consults and
/// populates `cache` so a response seen before within its TTL skips the
/// agent call.
pub fn check(driver: &mut dyn AgentDriver, cache: &mut TtlCache<Assessment>, step_number: &str, worker_response: &str, consecutive_issues: u32, prompt_template: &str) -> Assessment {
    let key = hash_key(&[step_number, worker_response]);
    if let Some(cached) = cache.get(&key) {
        return cached;
    }

    let prompt = prompt_template.replace("{step_number}", step_number).replace("{worker_response}", worker_response);
    let raw = match driver.continue_session(&prompt) {
        Ok(turn) => turn.response,
        Err(_) => {
            return fallback_continue_assessment();
        }
    };

    validate_response(SchemaKind::Assessment, &raw);
    let (score, reason, coaching_prompt) = parse_score_and_reason(&raw);
    let action = escalate(score, consecutive_issues);
    let assessment = Assessment {
        score,
        action,
        reason,
        prompt: coaching_prompt,
    };
    cache.put(key, assessment.clone());
    assessment
}

fn fallback_continue_assessment() -> Assessment {
    Assessment {
        score: 70,
        action: Action::Continue,
        reason: Some("supervisor turn failed; defaulting to continue".to_string()),
        prompt: None,
    }
}

/// Review a freshly created plan before execution begins.
pub fn review_plan(driver: &mut dyn AgentDriver, plan: &Plan, goal: &str, prompt_template: &str) -> PlanReview {
    let steps_summary = plan.steps.iter().map(|s| format!("{}. {}", s.number, s.description)).collect::<Vec<_>>().join("\n");
    let prompt = prompt_template.replace("{goal}", goal).replace("{steps}", &steps_summary);
    match driver.continue_session(&prompt) {
        Ok(turn) => {
            validate_response(SchemaKind::PlanReview, &turn.response);
            parse_plan_review(&turn.response)
        }
        Err(_) => PlanReview {
            approved: true,
            ..PlanReview::default()
        },
    }
}

/// Verify the worker's claim that a specific step is complete.
pub fn verify_step_completion(driver: &mut dyn AgentDriver, step_number: &str, claimed_response: &str, prompt_template: &str) -> StepVerification {
    let prompt = prompt_template.replace("{step_number}", step_number).replace("{claimed_response}", claimed_response);
    match driver.continue_session(&prompt) {
        Ok(turn) => {
            validate_response(SchemaKind::StepVerification, &turn.response);
            parse_step_verification(&turn.response)
        }
        Err(_) => StepVerification {
            verified: false,
            reason: Some("supervisor turn failed".to_string()),
        },
    }
}

/// Final end-to-end goal verification, once every step is terminal.
pub fn verify_goal_achieved(driver: &mut dyn AgentDriver, goal: &str, plan_summary: &str, prompt_template: &str) -> GoalVerification {
    let prompt = prompt_template.replace("{goal}", goal).replace("{plan_summary}", plan_summary);
    match driver.continue_session(&prompt) {
        Ok(turn) => {
            validate_response(SchemaKind::GoalVerification, &turn.response);
            parse_goal_verification(&turn.response)
        }
        Err(_) => GoalVerification {
            achieved: crate::core::tri::Tri::Partial,
            confidence: crate::core::tri::Confidence::Low,
            gaps: Vec::new(),
            recommendation: None,
            reason: Some("supervisor turn failed".to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::test_support::ScriptedAgentDriver;
    use std::time::Duration;

    #[test]
    fn check_parses_score_and_escalates() {
        let mut driver = ScriptedAgentDriver::new(vec![r#"{"score": 20, "reason": "off track"}"#.to_string()]);
        driver.start_session("ctx", "go").expect("seed session");
        let mut cache: TtlCache<Assessment> = TtlCache::new(16, Duration::from_secs(60));
        let assessment = check(&mut driver, &mut cache, "1", "I did something unrelated", 0, "step {step_number}: {worker_response}");
        assert_eq!(assessment.score, 20);
        assert_eq!(assessment.action, Action::Refocus);
    }

    #[test]
    fn check_uses_the_cache_on_a_repeated_input() {
        let mut driver = ScriptedAgentDriver::new(vec![r#"{"score": 90}"#.to_string()]);
        driver.start_session("ctx", "go").expect("seed session");
        let mut cache: TtlCache<Assessment> = TtlCache::new(16, Duration::from_secs(60));
        let first = check(&mut driver, &mut cache, "1", "same response", 0, "{step_number} {worker_response}");
        let second = check(&mut driver, &mut cache, "1", "same response", 0, "{step_number} {worker_response}");
        assert_eq!(first.score, second.score);
    }

    #[test]
    fn review_plan_parses_rejection() {
        let mut driver = ScriptedAgentDriver::new(vec![r#"{"approved": false, "issues": ["missing tests"]}"#.to_string()]);
        driver.start_session("ctx", "go").expect("seed session");
        let plan = Plan {
            analysis: String::new(),
            steps: Vec::new(),
            next_sequence: 1,
        };
        let review = review_plan(&mut driver, &plan, "goal", "{goal}\n{steps}");
        assert!(!review.approved);
        assert_eq!(review.issues, vec!["missing tests".to_string()]);
    }
}
