//! Hierarchy-aware step selection, ready-set filtering, and auto-completion.
//!
//! Steps live in a flat vector inside [`Plan`] and address parent/child
//! relationships by step number rather than by pointer (see §9 of the
//! design notes this engine was built against: cyclic parent/child
//! relationships are not represented as owned trees).

use std::collections::HashSet;

use super::dependency::parallel_compatible;
use super::types::{Plan, Step, StepStatus};

/// The current step: the leftmost non-terminal leaf in plan order whose
/// ancestors are all `decomposed`, recursing through further decompositions.
/// A `decomposed` step is never returned itself.
pub fn current_step(plan: &Plan) -> Option<&Step> {
    plan.steps
        .iter()
        .filter(|s| s.parent_number.is_none())
        .find_map(|top| leftmost_open_leaf(plan, top))
}

fn leftmost_open_leaf<'a>(plan: &'a Plan, step: &'a Step) -> Option<&'a Step> {
    if step.is_leaf() {
        return (!step.status.is_terminal() && step.status != StepStatus::Decomposed).then_some(step);
    }
    step.decomposed_into
        .iter()
        .filter_map(|child_number| plan.find(child_number))
        .find_map(|child| leftmost_open_leaf(plan, child))
}

/// Re-derive `Decomposed` parents' statuses from their children's, applied
/// repeatedly to a fixed point (decompositions may nest). Returns the
/// numbers of steps whose status changed, in deterministic (lexicographic)
/// order.
pub fn derive_decomposed_statuses(plan: &mut Plan) -> Vec<String> {
    let mut changed = Vec::new();
    loop {
        let mut any_changed = false;
        let parent_numbers: Vec<String> = plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Decomposed)
            .map(|s| s.number.clone())
            .collect();

        for number in parent_numbers {
            let children: Vec<StepStatus> = {
                let parent = plan.find(&number).expect("looked up by number");
                parent
                    .decomposed_into
                    .iter()
                    .filter_map(|c| plan.find(c))
                    .map(|c| c.status)
                    .collect()
            };
            if children.is_empty() {
                continue;
            }
            let all_completed = children.iter().all(|s| *s == StepStatus::Completed);
            let no_pending = !children.iter().any(|s| *s == StepStatus::Pending);
            let any_failed = children.iter().any(|s| *s == StepStatus::Failed);

            let next_status = if all_completed {
                Some(StepStatus::Completed)
            } else if no_pending && any_failed {
                Some(StepStatus::Failed)
            } else {
                None
            };

            if let Some(next_status) = next_status {
                let parent = plan.find_mut(&number).expect("looked up by number");
                if parent.status != next_status {
                    parent.status = next_status;
                    if next_status == StepStatus::Completed {
                        parent.completed_via_subtasks = true;
                    }
                    any_changed = true;
                    changed.push(number);
                }
            }
        }

        if !any_changed {
            break;
        }
    }
    changed.sort();
    changed.dedup();
    changed
}

/// Non-terminal leaf steps whose dependencies are all in `completed` and
/// which are not `in_progress`, `decomposed`, `skipped`, `failed`, or
/// `completed`.
pub fn ready_steps<'a>(plan: &'a Plan, completed: &HashSet<String>) -> Vec<&'a Step> {
    plan.steps
        .iter()
        .filter(|s| s.is_leaf())
        .filter(|s| {
            !matches!(
                s.status,
                StepStatus::InProgress
                    | StepStatus::Decomposed
                    | StepStatus::Skipped
                    | StepStatus::Failed
                    | StepStatus::Completed
            )
        })
        .filter(|s| s.dependencies.iter().all(|d| completed.contains(d)))
        .collect()
}

/// The largest mutually-parallelizable subset of `ready`, bounded by
/// `pool_size`. Greedy: accepts a candidate only if it is compatible with
/// every step already accepted.
pub fn next_executable_batch<'a>(ready: &[&'a Step], pool_size: usize) -> Vec<&'a Step> {
    let mut batch: Vec<&Step> = Vec::new();
    for &candidate in ready {
        if batch.len() >= pool_size {
            break;
        }
        if batch.iter().all(|&accepted| parallel_compatible(accepted, candidate)) {
            batch.push(candidate);
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Complexity;

    fn leaf(number: &str, status: StepStatus) -> Step {
        let mut step = Step::new(number, format!("step {number}"), Complexity::Simple);
        step.status = status;
        step
    }

    #[test]
    fn current_step_skips_decomposed_parent_and_returns_first_open_child() {
        let mut parent = leaf("1", StepStatus::Decomposed);
        parent.decomposed_into = vec!["1.1".to_string(), "1.2".to_string()];
        let mut child1 = leaf("1.1", StepStatus::Completed);
        child1.parent_number = Some("1".to_string());
        let mut child2 = leaf("1.2", StepStatus::Pending);
        child2.parent_number = Some("1".to_string());

        let plan = Plan {
            analysis: String::new(),
            steps: vec![parent, child1, child2],
            next_sequence: 3,
        };

        let current = current_step(&plan).expect("some open leaf");
        assert_eq!(current.number, "1.2");
    }

    #[test]
    fn current_step_recurses_into_nested_decompositions() {
        let mut top = leaf("1", StepStatus::Decomposed);
        top.decomposed_into = vec!["1.1".to_string()];
        let mut mid = leaf("1.1", StepStatus::Decomposed);
        mid.parent_number = Some("1".to_string());
        mid.decomposed_into = vec!["1.1.1".to_string()];
        let mut leaf_step = leaf("1.1.1", StepStatus::Pending);
        leaf_step.parent_number = Some("1.1".to_string());

        let plan = Plan {
            analysis: String::new(),
            steps: vec![top, mid, leaf_step],
            next_sequence: 4,
        };

        let current = current_step(&plan).expect("open leaf");
        assert_eq!(current.number, "1.1.1");
    }

    #[test]
    fn derive_decomposed_statuses_completes_parent_when_all_children_done() {
        let mut parent = leaf("1", StepStatus::Decomposed);
        parent.decomposed_into = vec!["1.1".to_string(), "1.2".to_string()];
        let mut c1 = leaf("1.1", StepStatus::Completed);
        c1.parent_number = Some("1".to_string());
        let mut c2 = leaf("1.2", StepStatus::Completed);
        c2.parent_number = Some("1".to_string());

        let mut plan = Plan {
            analysis: String::new(),
            steps: vec![parent, c1, c2],
            next_sequence: 3,
        };

        let changed = derive_decomposed_statuses(&mut plan);
        assert_eq!(changed, vec!["1".to_string()]);
        let parent = plan.find("1").unwrap();
        assert_eq!(parent.status, StepStatus::Completed);
        assert!(parent.completed_via_subtasks);
    }

    #[test]
    fn derive_decomposed_statuses_fails_parent_when_no_child_pending_and_one_failed() {
        let mut parent = leaf("1", StepStatus::Decomposed);
        parent.decomposed_into = vec!["1.1".to_string(), "1.2".to_string()];
        let mut c1 = leaf("1.1", StepStatus::Failed);
        c1.parent_number = Some("1".to_string());
        let mut c2 = leaf("1.2", StepStatus::Completed);
        c2.parent_number = Some("1".to_string());

        let mut plan = Plan {
            analysis: String::new(),
            steps: vec![parent, c1, c2],
            next_sequence: 3,
        };

        derive_decomposed_statuses(&mut plan);
        assert_eq!(plan.find("1").unwrap().status, StepStatus::Failed);
    }

    #[test]
    fn derive_decomposed_statuses_waits_while_a_child_is_pending() {
        let mut parent = leaf("1", StepStatus::Decomposed);
        parent.decomposed_into = vec!["1.1".to_string(), "1.2".to_string()];
        let mut c1 = leaf("1.1", StepStatus::Failed);
        c1.parent_number = Some("1".to_string());
        let mut c2 = leaf("1.2", StepStatus::Pending);
        c2.parent_number = Some("1".to_string());

        let mut plan = Plan {
            analysis: String::new(),
            steps: vec![parent, c1, c2],
            next_sequence: 3,
        };

        let changed = derive_decomposed_statuses(&mut plan);
        assert!(changed.is_empty());
        assert_eq!(plan.find("1").unwrap().status, StepStatus::Decomposed);
    }

    #[test]
    fn ready_steps_excludes_in_progress_decomposed_skipped_failed_completed() {
        let statuses = [
            StepStatus::InProgress,
            StepStatus::Decomposed,
            StepStatus::Skipped,
            StepStatus::Failed,
            StepStatus::Completed,
            StepStatus::Pending,
        ];
        let steps: Vec<Step> = statuses
            .iter()
            .enumerate()
            .map(|(i, s)| leaf(&(i + 1).to_string(), *s))
            .collect();
        let plan = Plan {
            analysis: String::new(),
            steps,
            next_sequence: 7,
        };

        let ready = ready_steps(&plan, &HashSet::new());
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].status, StepStatus::Pending);
    }

    #[test]
    fn ready_steps_requires_satisfied_dependencies() {
        let mut blocked_on_dep = leaf("2", StepStatus::Pending);
        blocked_on_dep.dependencies = vec!["1".to_string()];
        let plan = Plan {
            analysis: String::new(),
            steps: vec![leaf("1", StepStatus::Pending), blocked_on_dep],
            next_sequence: 3,
        };

        let none_completed = ready_steps(&plan, &HashSet::new());
        assert_eq!(none_completed.len(), 1);
        assert_eq!(none_completed[0].number, "1");

        let mut completed = HashSet::new();
        completed.insert("1".to_string());
        let now_ready = ready_steps(&plan, &completed);
        assert_eq!(now_ready.len(), 2);
    }

    #[test]
    fn next_executable_batch_never_pairs_incompatible_steps() {
        let mut a = leaf("1", StepStatus::Pending);
        let mut b = leaf("2", StepStatus::Pending);
        let c = leaf("3", StepStatus::Pending);
        a.dependencies = vec![];
        b.dependencies = vec!["1".to_string()]; // depends on a: incompatible
        let refs = [&a, &b, &c];
        let batch = next_executable_batch(&refs, 3);
        assert!(batch.iter().any(|s| s.number == "1"));
        assert!(!batch.iter().any(|s| s.number == "2"));
        assert!(batch.iter().any(|s| s.number == "3"));
    }
}
