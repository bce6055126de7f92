//! Planner: drives the planning agent conversation and parses its output
//! into a [`Plan`]/[`SubPlan`] via [`crate::core::plan_parse`].

use anyhow::{Context, Result};

use crate::core::plan_parse::parse_plan;
use crate::core::types::{Complexity, Plan, Step, SubPlan};
use crate::io::agent_driver::AgentDriver;

/// Create an initial plan for `goal`, starting a fresh planner session.
pub fn create_plan(driver: &mut dyn AgentDriver, system_context: &str, goal: &str, prompt_template: &str) -> Result<Plan> {
    let prompt = prompt_template.replace("{goal}", goal);
    let turn = driver.start_session(system_context, &prompt).context("planner start_session")?;
    Ok(parse_plan(&turn.response))
}

/// Decompose a single complex step into a set of child steps, numbered as
/// `{parent}.1`, `{parent}.2`, ... in the order the agent returned them.
pub fn decompose_step(driver: &mut dyn AgentDriver, step: &Step, prompt_template: &str) -> Result<Vec<Step>> {
    let prompt = prompt_template.replace("{step_number}", &step.number).replace("{description}", &step.description);
    let turn = driver.continue_session(&prompt).context("planner decompose_step")?;
    let parsed = parse_plan(&turn.response);
    Ok(parsed
        .steps
        .into_iter()
        .enumerate()
        .map(|(i, mut child)| {
            child.number = format!("{}.{}", step.number, i + 1);
            child.parent_number = Some(step.number.clone());
            child
        })
        .collect())
}

/// Create a gap plan after a cycle's verification reports the goal is not
/// yet achieved: a small ordered sequence of new top-level steps targeting
/// the reported gaps and any failed steps, numbered from `next_sequence`.
/// Returns the new steps and the `next_sequence` the caller should store.
pub fn create_gap_plan(
    driver: &mut dyn AgentDriver,
    goal: &str,
    gaps: &[String],
    failed_steps: &[Step],
    next_sequence: u32,
    prompt_template: &str,
) -> Result<(Vec<Step>, u32)> {
    let gaps_text = if gaps.is_empty() { "(none reported)".to_string() } else { gaps.join("\n") };
    let failed_text = if failed_steps.is_empty() {
        "(none)".to_string()
    } else {
        failed_steps.iter().map(|s| format!("{}: {}", s.number, s.description)).collect::<Vec<_>>().join("\n")
    };
    let prompt = prompt_template.replace("{goal}", goal).replace("{gaps}", &gaps_text).replace("{failed_steps}", &failed_text);
    let turn = driver.continue_session(&prompt).context("planner create_gap_plan")?;
    let parsed = parse_plan(&turn.response);
    let mut sequence = next_sequence;
    let steps: Vec<Step> = parsed
        .steps
        .into_iter()
        .map(|mut child| {
            child.number = sequence.to_string();
            child.parent_number = None;
            sequence += 1;
            child
        })
        .collect();
    Ok((steps, sequence))
}

/// Create a salvage [`SubPlan`] for a blocked top-level step: a small
/// ordered sequence of sub-steps that retry the same objective by a
/// different route.
pub fn create_sub_plan(driver: &mut dyn AgentDriver, step: &Step, reason: &str, prompt_template: &str) -> Result<SubPlan> {
    let prompt = prompt_template
        .replace("{step_number}", &step.number)
        .replace("{description}", &step.description)
        .replace("{reason}", reason);
    let turn = driver.continue_session(&prompt).context("planner create_sub_plan")?;
    let parsed = parse_plan(&turn.response);
    let steps: Vec<Step> = parsed
        .steps
        .into_iter()
        .enumerate()
        .map(|(i, mut child)| {
            child.number = format!("{}.{}", step.number, i + 1);
            child.parent_number = Some(step.number.clone());
            if parsed.analysis.is_empty() && child.complexity == Complexity::Medium {
                child.complexity = step.complexity;
            }
            child
        })
        .collect();
    Ok(SubPlan {
        parent_number: step.number.clone(),
        reason: reason.to_string(),
        steps,
    })
}
