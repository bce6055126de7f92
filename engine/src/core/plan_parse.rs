//! Parse a planner agent's raw textual response into a [`Plan`].
//!
//! The agent is instructed to emit a strict template:
//!
//! ```text
//! ANALYSIS:
//! <free text>
//! PLAN:
//! 1. description | complexity
//! 2. description | complexity
//! TOTAL_STEPS: N
//! ```
//!
//! Parsing is line-oriented and tolerant of a missing complexity tag
//! (defaults to `medium`). If no `PLAN:` block is found at all, a
//! best-effort fallback extracts any numbered list from the raw text.

use super::dependency::{assign_parallel_groups, compute_dependencies, extract_artifacts, extract_requirements};
use super::types::{Complexity, Plan, Step};

fn parse_complexity(raw: &str) -> Complexity {
    match raw.trim().to_ascii_lowercase().as_str() {
        "simple" => Complexity::Simple,
        "complex" => Complexity::Complex,
        _ => Complexity::Medium,
    }
}

/// Split a single `PLAN:` line of the form `N. description | complexity`
/// (the `| complexity` suffix is optional) into `(number, description,
/// complexity)`. Returns `None` if the line isn't numbered.
fn parse_numbered_line(line: &str) -> Option<(String, String, Complexity)> {
    let trimmed = line.trim();
    let dot = trimmed.find('.')?;
    let (number_part, rest) = trimmed.split_at(dot);
    if number_part.is_empty() || !number_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let rest = rest[1..].trim();
    if rest.is_empty() {
        return None;
    }
    let (description, complexity) = match rest.rsplit_once('|') {
        Some((desc, tag)) => (desc.trim().to_string(), parse_complexity(tag)),
        None => (rest.to_string(), Complexity::Medium),
    };
    Some((number_part.to_string(), description, complexity))
}

/// Parse the planner's strict template. Falls back to extracting any
/// numbered list from the raw text if no `PLAN:` section is present.
pub fn parse_plan(raw: &str) -> Plan {
    let analysis = extract_analysis(raw);
    let mut steps = extract_plan_block(raw).unwrap_or_else(|| fallback_numbered_list(raw));

    for step in &mut steps {
        step.artifacts = extract_artifacts(&step.description);
        step.requirements = extract_requirements(&step.description);
    }
    compute_dependencies(&mut steps);
    assign_parallel_groups(&mut steps);

    let next_sequence = steps.len() as u32 + 1;
    Plan {
        analysis,
        steps,
        next_sequence,
    }
}

fn extract_analysis(raw: &str) -> String {
    let Some(after) = raw.find("ANALYSIS:").map(|i| i + "ANALYSIS:".len()) else {
        return String::new();
    };
    let slice = &raw[after..];
    let end = slice.find("PLAN:").unwrap_or(slice.len());
    slice[..end].trim().to_string()
}

fn extract_plan_block(raw: &str) -> Option<Vec<Step>> {
    let after = raw.find("PLAN:")? + "PLAN:".len();
    let slice = &raw[after..];
    let end = slice.find("TOTAL_STEPS:").unwrap_or(slice.len());
    let block = &slice[..end];

    let steps: Vec<Step> = block
        .lines()
        .filter_map(parse_numbered_line)
        .map(|(number, description, complexity)| Step::new(number, description, complexity))
        .collect();

    (!steps.is_empty()).then_some(steps)
}

/// Best-effort recovery when the agent didn't follow the template: treat
/// any numbered line anywhere in the response as a step.
fn fallback_numbered_list(raw: &str) -> Vec<Step> {
    raw.lines()
        .filter_map(parse_numbered_line)
        .map(|(number, description, complexity)| Step::new(number, description, complexity))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::StepStatus;

    const WELL_FORMED: &str = "\
ANALYSIS:
The goal requires a new endpoint backed by a database migration.
PLAN:
1. Configure the project environment | simple
2. Create the database migration | medium
3. Implement the api endpoint | complex
4. Write tests for the endpoint | medium
TOTAL_STEPS: 4
";

    #[test]
    fn parses_well_formed_template() {
        let plan = parse_plan(WELL_FORMED);
        assert_eq!(plan.total_steps(), 4);
        assert!(plan.analysis.contains("new endpoint"));
        assert_eq!(plan.steps[0].complexity, Complexity::Simple);
        assert_eq!(plan.steps[2].complexity, Complexity::Complex);
        for step in &plan.steps {
            assert_eq!(step.status, StepStatus::Pending);
        }
    }

    #[test]
    fn missing_complexity_tag_defaults_to_medium() {
        let raw = "PLAN:\n1. Do the thing\nTOTAL_STEPS: 1\n";
        let plan = parse_plan(raw);
        assert_eq!(plan.steps[0].complexity, Complexity::Medium);
    }

    #[test]
    fn dependency_analysis_runs_after_parsing() {
        let plan = parse_plan(WELL_FORMED);
        // Step 3 (implement the api endpoint) should depend on step 1 (setup).
        assert!(plan.steps[2].dependencies.contains(&"1".to_string()));
    }

    #[test]
    fn falls_back_to_numbered_list_without_plan_marker() {
        let raw = "Here is what I'll do:\n1. Set up the repo\n2. Add a test\nThanks.";
        let plan = parse_plan(raw);
        assert_eq!(plan.total_steps(), 2);
        assert_eq!(plan.steps[1].description, "Add a test");
    }

    #[test]
    fn unparseable_response_yields_an_empty_plan() {
        let plan = parse_plan("I could not understand the task.");
        assert_eq!(plan.total_steps(), 0);
    }
}
