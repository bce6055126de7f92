//! Dependency analysis over a freshly parsed plan.
//!
//! Enriches each step with artifact/requirement labels extracted from its
//! description, then derives dependency edges and parallelizability from
//! those labels. Pure text classification: no I/O, no agent calls.

use std::collections::BTreeSet;

use super::types::{Label, LabelBucket, Step};

const CREATION_VERBS: &[&str] = &["create", "write", "implement", "build", "add", "generate"];
const CONSUMPTION_VERBS: &[&str] = &["use", "read", "test", "verify", "check", "validate"];
const TESTING_VERBS: &[&str] = &["test", "verify", "check", "validate"];
const SETUP_VERBS: &[&str] = &["setup", "configure", "install", "initialize", "scaffold"];

const EXCLUSIVE_RESOURCES: &[&str] = &["database", "config", "env"];

fn classify_word(word: &str) -> Option<LabelBucket> {
    match word {
        "file" | "files" | "module" | "struct" | "function" => Some(LabelBucket::Files),
        "test" | "tests" | "spec" => Some(LabelBucket::Tests),
        "database" | "db" | "schema" | "migration" => Some(LabelBucket::Database),
        "api" | "endpoint" | "route" | "handler" => Some(LabelBucket::Api),
        "ui" | "frontend" | "component" | "page" => Some(LabelBucket::Ui),
        "docs" | "documentation" | "readme" => Some(LabelBucket::Docs),
        "config" | "configuration" | "env" | "settings" => Some(LabelBucket::Config),
        _ => None,
    }
}

fn words(description: &str) -> Vec<String> {
    description
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_ascii_lowercase())
        .collect()
}

/// Quoted entities are captured verbatim as `Files`-bucket labels regardless
/// of surrounding verb.
fn quoted_entities(description: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars = description.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        if c != '"' {
            continue;
        }
        if let Some(end) = description[start + 1..].find('"') {
            let entity = &description[start + 1..start + 1 + end];
            if !entity.is_empty() {
                out.push(entity.to_string());
            }
        }
    }
    out
}

/// Extract the artifact labels a step plausibly produces.
pub fn extract_artifacts(description: &str) -> Vec<Label> {
    extract_labels(description, CREATION_VERBS)
}

/// Extract the requirement labels a step plausibly consumes.
pub fn extract_requirements(description: &str) -> Vec<Label> {
    extract_labels(description, CONSUMPTION_VERBS)
}

fn extract_labels(description: &str, verbs: &[&str]) -> Vec<Label> {
    let lowered = description.to_ascii_lowercase();
    if !verbs.iter().any(|v| lowered.contains(v)) {
        return Vec::new();
    }

    let mut labels: BTreeSet<Label> = BTreeSet::new();
    for word in words(description) {
        if let Some(bucket) = classify_word(&word) {
            labels.insert(Label {
                bucket,
                name: word,
            });
        }
    }
    for entity in quoted_entities(description) {
        labels.insert(Label {
            bucket: LabelBucket::Files,
            name: entity.to_ascii_lowercase(),
        });
    }
    labels.into_iter().collect()
}

fn is_testing_step(description: &str) -> bool {
    let lowered = description.to_ascii_lowercase();
    TESTING_VERBS.iter().any(|v| lowered.contains(v))
}

fn is_setup_step(description: &str) -> bool {
    let lowered = description.to_ascii_lowercase();
    SETUP_VERBS.iter().any(|v| lowered.contains(v))
}

fn shared_content_words(a: &str, b: &str) -> usize {
    let wa: BTreeSet<String> = words(a).into_iter().collect();
    let wb: BTreeSet<String> = words(b).into_iter().collect();
    wa.intersection(&wb).count()
}

/// Populate `dependencies`/`dependents` for every step in plan order.
///
/// For step `i`, an edge `j -> i` (i.e. `i` depends on `j`) exists when:
/// - `requirements(i) ∩ artifacts(j) ≠ ∅`, or
/// - `i` is a testing/verifying step and `j` is a creation step sharing at
///   least two content words, or
/// - `j` is a setup/configure/install step (everything depends on setup).
pub fn compute_dependencies(steps: &mut [Step]) {
    let n = steps.len();
    for i in 0..n {
        let mut deps: BTreeSet<String> = BTreeSet::new();
        for j in 0..i {
            let depends = {
                let (si, sj) = (&steps[i], &steps[j]);
                let shares_label = si
                    .requirements
                    .iter()
                    .any(|r| sj.artifacts.iter().any(|a| a == r));
                let testing_pair = is_testing_step(&si.description)
                    && shared_content_words(&si.description, &sj.description) >= 2
                    && !is_testing_step(&sj.description);
                let setup_dep = is_setup_step(&sj.description) && !is_setup_step(&si.description);
                shares_label || testing_pair || setup_dep
            };
            if depends {
                deps.insert(steps[j].number.clone());
            }
        }
        steps[i].dependencies = deps.into_iter().collect();
    }

    // Derive dependents from dependencies.
    let all_numbers: Vec<String> = steps.iter().map(|s| s.number.clone()).collect();
    for number in &all_numbers {
        let dependents: Vec<String> = steps
            .iter()
            .filter(|s| s.dependencies.iter().any(|d| d == number))
            .map(|s| s.number.clone())
            .collect();
        if let Some(step) = steps.iter_mut().find(|s| &s.number == number) {
            step.dependents = dependents;
        }
    }
}

fn requires_exclusive_resource(step: &Step) -> Option<&'static str> {
    let lowered = step.description.to_ascii_lowercase();
    EXCLUSIVE_RESOURCES.iter().find(|r| lowered.contains(*r)).copied()
}

/// Two steps may run in parallel iff neither depends on the other, they
/// share no artifact label, and they do not both require an exclusive
/// resource.
pub fn parallel_compatible(a: &Step, b: &Step) -> bool {
    if a.dependencies.iter().any(|d| d == &b.number) || b.dependencies.iter().any(|d| d == &a.number) {
        return false;
    }
    let shares_artifact = a.artifacts.iter().any(|x| b.artifacts.contains(x));
    if shares_artifact {
        return false;
    }
    if let (Some(ra), Some(rb)) = (requires_exclusive_resource(a), requires_exclusive_resource(b))
        && ra == rb
    {
        return false;
    }
    true
}

/// Mark `can_parallelize`/`parallel_group` for peers at the same dependency
/// frontier (identical dependency sets) that are mutually compatible.
pub fn assign_parallel_groups(steps: &mut [Step]) {
    let n = steps.len();
    let mut group_of: Vec<Option<usize>> = vec![None; n];
    let mut next_group = 0usize;

    for i in 0..n {
        if group_of[i].is_some() {
            continue;
        }
        let mut members = vec![i];
        for j in (i + 1)..n {
            if group_of[j].is_some() {
                continue;
            }
            if steps[i].dependencies != steps[j].dependencies {
                continue;
            }
            if members.iter().all(|&m| parallel_compatible(&steps[m], &steps[j])) {
                members.push(j);
            }
        }
        if members.len() > 1 {
            let group_id = format!("pg-{next_group}");
            next_group += 1;
            for &m in &members {
                group_of[m] = Some(members.len());
                steps[m].can_parallelize = true;
                steps[m].parallel_group = Some(group_id.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Complexity;

    #[test]
    fn quoted_entities_captured_verbatim() {
        let labels = extract_artifacts(r#"create "UserModel" for the api"#);
        assert!(labels.iter().any(|l| l.name == "usermodel"));
    }

    #[test]
    fn requirements_match_prior_artifacts_create_dependency() {
        let mut steps = vec![
            Step::new("1", "create the user api endpoint", Complexity::Medium),
            Step::new("2", "use the api to write a client", Complexity::Medium),
        ];
        steps[0].artifacts = extract_artifacts(&steps[0].description.clone());
        steps[1].requirements = extract_requirements(&steps[1].description.clone());
        compute_dependencies(&mut steps);
        assert_eq!(steps[1].dependencies, vec!["1".to_string()]);
        assert_eq!(steps[0].dependents, vec!["2".to_string()]);
    }

    #[test]
    fn setup_step_is_a_universal_dependency() {
        let mut steps = vec![
            Step::new("1", "configure the project environment", Complexity::Simple),
            Step::new("2", "implement the widget", Complexity::Medium),
        ];
        compute_dependencies(&mut steps);
        assert_eq!(steps[1].dependencies, vec!["1".to_string()]);
    }

    #[test]
    fn parallel_compatible_rejects_shared_artifact() {
        let mut a = Step::new("1", "create files", Complexity::Simple);
        let mut b = Step::new("2", "create files", Complexity::Simple);
        let label = Label { bucket: LabelBucket::Files, name: "shared".to_string() };
        a.artifacts.push(label.clone());
        b.artifacts.push(label);
        assert!(!parallel_compatible(&a, &b));
    }

    #[test]
    fn parallel_compatible_rejects_mutual_dependency() {
        let mut a = Step::new("1", "a", Complexity::Simple);
        let b = Step::new("2", "b", Complexity::Simple);
        a.dependencies.push("2".to_string());
        assert!(!parallel_compatible(&a, &b));
    }

    #[test]
    fn parallel_compatible_rejects_shared_exclusive_resource() {
        let a = Step::new("1", "update the database schema", Complexity::Simple);
        let b = Step::new("2", "add a database migration", Complexity::Simple);
        assert!(!parallel_compatible(&a, &b));
    }
}
