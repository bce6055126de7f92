//! Shared deterministic types for the orchestration core.
//!
//! These types define stable contracts between components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use serde::{Deserialize, Serialize};

/// How hard a step is expected to be. Drives decomposition and model choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

/// Lifecycle state of a single step.
///
/// `Decomposed` is special: a decomposed step is never itself executed and
/// its terminal status is derived from its children (see
/// [`crate::core::selector`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
    Skipped,
    Decomposed,
}

impl StepStatus {
    /// Terminal statuses are final for non-decomposed steps.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// A buckets-of-labels classification used by dependency analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelBucket {
    Files,
    Tests,
    Database,
    Api,
    Ui,
    Docs,
    Config,
}

/// A single labeled artifact or requirement a step plausibly produces or
/// consumes, e.g. `(Files, "user_model")`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label {
    pub bucket: LabelBucket,
    pub name: String,
}

/// One step within a [`Plan`].
///
/// Identity fields (`number`, `description`, `complexity`) are set once at
/// creation time and never mutated. Everything else is runner-owned mutable
/// state, recomputed by [`crate::core::selector`] rather than trusted
/// verbatim from whatever the agent claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the plan. Decimal-hierarchical for decomposed
    /// sub-steps, e.g. `"1.1"`, `"1.11"`.
    pub number: String,
    pub description: String,
    pub complexity: Complexity,

    pub status: StepStatus,
    pub fail_reason: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,

    /// Step numbers this step depends on. Always lower-numbered in plan
    /// order.
    pub dependencies: Vec<String>,
    /// Derived: step numbers that depend on this one.
    pub dependents: Vec<String>,

    pub artifacts: Vec<Label>,
    pub requirements: Vec<Label>,

    pub can_parallelize: bool,
    pub parallel_group: Option<String>,

    /// Child step numbers, set when this step was decomposed.
    pub decomposed_into: Vec<String>,
    /// Parent step number, set when this step is itself a sub-step.
    pub parent_number: Option<String>,
    pub completed_via_subtasks: bool,

    /// Set once a salvage [`SubPlan`] has been attempted for this step.
    pub sub_planned: bool,
    /// Set once a decomposition attempt has been made for this step, so a
    /// complex step whose decomposition comes back empty is executed
    /// directly instead of re-attempting decomposition every turn.
    #[serde(default)]
    pub decompose_attempted: bool,
}

impl Step {
    /// A fresh, unexecuted step with identity fields set and everything
    /// else at its default.
    pub fn new(number: impl Into<String>, description: impl Into<String>, complexity: Complexity) -> Self {
        Self {
            number: number.into(),
            description: description.into(),
            complexity,
            status: StepStatus::Pending,
            fail_reason: None,
            start_time: None,
            end_time: None,
            dependencies: Vec::new(),
            dependents: Vec::new(),
            artifacts: Vec::new(),
            requirements: Vec::new(),
            can_parallelize: false,
            parallel_group: None,
            decomposed_into: Vec::new(),
            parent_number: None,
            completed_via_subtasks: false,
            sub_planned: false,
            decompose_attempted: false,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.decomposed_into.is_empty()
    }
}

/// Ordered sequence of steps produced by the Planner from a single goal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub analysis: String,
    pub steps: Vec<Step>,
    /// Next number to assign when injecting decomposed or gap-plan steps.
    pub next_sequence: u32,
}

impl Plan {
    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    pub fn find(&self, number: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.number == number)
    }

    pub fn find_mut(&mut self, number: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.number == number)
    }
}

/// A salvage plan created when a top-level step is blocked: a small ordered
/// sequence of sub-steps that retry the same objective.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubPlan {
    pub parent_number: String,
    pub reason: String,
    pub steps: Vec<Step>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_step_is_pending_and_a_leaf() {
        let step = Step::new("1", "do the thing", Complexity::Medium);
        assert_eq!(step.status, StepStatus::Pending);
        assert!(step.is_leaf());
        assert!(!step.sub_planned);
    }

    #[test]
    fn terminal_statuses_match_spec_set() {
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::InProgress.is_terminal());
        assert!(!StepStatus::Blocked.is_terminal());
        assert!(!StepStatus::Decomposed.is_terminal());
    }

    #[test]
    fn plan_total_steps_matches_vec_len() {
        let plan = Plan {
            analysis: "a".to_string(),
            steps: vec![
                Step::new("1", "a", Complexity::Simple),
                Step::new("2", "b", Complexity::Simple),
            ],
            next_sequence: 3,
        };
        assert_eq!(plan.total_steps(), 2);
        assert!(plan.find("1").is_some());
        assert!(plan.find("3").is_none());
    }
}
