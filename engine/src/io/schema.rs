//! Schema-constrained validation of structured agent output.
//!
//! Every JSON object the Planner/Supervisor/Verifier expect back from an
//! agent turn is checked against a Draft 2020-12 JSON Schema before being
//! trusted. Grounded in the teacher's `runner` binary's `validate_schema`
//! (`jsonschema::options().with_draft(Draft::Draft202012).build(...)`),
//! generalized from one embedded `task_tree` schema to the handful of
//! agent-output shapes this engine expects. Unlike the teacher's use
//! (where a failing tree fails `runner validate` outright), this check is
//! advisory: `core::supervisor::parse_*` already degrades gracefully on
//! malformed agent text, so a schema failure here is only logged, never
//! propagated as a hard error.

use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use jsonschema::{Draft, Validator};
use serde_json::Value;
use tracing::warn;

const ASSESSMENT_SCHEMA: &str = include_str!("../../../schemas/assessment.schema.json");
const PLAN_REVIEW_SCHEMA: &str = include_str!("../../../schemas/plan_review.schema.json");
const STEP_VERIFICATION_SCHEMA: &str = include_str!("../../../schemas/step_verification.schema.json");
const GOAL_VERIFICATION_SCHEMA: &str = include_str!("../../../schemas/goal_verification.schema.json");

/// Which embedded schema governs a given agent response shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    Assessment,
    PlanReview,
    StepVerification,
    GoalVerification,
}

impl SchemaKind {
    fn source(self) -> &'static str {
        match self {
            SchemaKind::Assessment => ASSESSMENT_SCHEMA,
            SchemaKind::PlanReview => PLAN_REVIEW_SCHEMA,
            SchemaKind::StepVerification => STEP_VERIFICATION_SCHEMA,
            SchemaKind::GoalVerification => GOAL_VERIFICATION_SCHEMA,
        }
    }

    fn file_name(self) -> &'static str {
        match self {
            SchemaKind::Assessment => "assessment.schema.json",
            SchemaKind::PlanReview => "plan_review.schema.json",
            SchemaKind::StepVerification => "step_verification.schema.json",
            SchemaKind::GoalVerification => "goal_verification.schema.json",
        }
    }

    const ALL: [SchemaKind; 4] = [SchemaKind::Assessment, SchemaKind::PlanReview, SchemaKind::StepVerification, SchemaKind::GoalVerification];
}

fn validator_for(kind: SchemaKind) -> &'static Validator {
    static ASSESSMENT: OnceLock<Validator> = OnceLock::new();
    static PLAN_REVIEW: OnceLock<Validator> = OnceLock::new();
    static STEP_VERIFICATION: OnceLock<Validator> = OnceLock::new();
    static GOAL_VERIFICATION: OnceLock<Validator> = OnceLock::new();

    let cell = match kind {
        SchemaKind::Assessment => &ASSESSMENT,
        SchemaKind::PlanReview => &PLAN_REVIEW,
        SchemaKind::StepVerification => &STEP_VERIFICATION,
        SchemaKind::GoalVerification => &GOAL_VERIFICATION,
    };
    cell.get_or_init(|| {
        let schema: Value = serde_json::from_str(kind.source()).expect("embedded schema is valid json");
        jsonschema::options().with_draft(Draft::Draft202012).build(&schema).expect("embedded schema compiles")
    })
}

/// Extract the first top-level JSON object from `raw` and validate it
/// against `kind`'s schema, logging (but never returning) a failure.
/// Returns whether the response validated cleanly, purely for tests and
/// metrics — callers are never expected to branch on this.
pub fn validate_response(kind: SchemaKind, raw: &str) -> bool {
    let Some(start) = raw.find('{') else {
        warn!(?kind, "agent response has no JSON object to validate against schema");
        return false;
    };
    let Some(end) = raw.rfind('}') else {
        return false;
    };
    if end <= start {
        return false;
    }

    let value: Value = match serde_json::from_str(&raw[start..=end]) {
        Ok(v) => v,
        Err(e) => {
            warn!(?kind, err = %e, "agent response is not valid json, skipping schema validation");
            return false;
        }
    };

    let errors: Vec<String> = validator_for(kind).iter_errors(&value).map(|e| e.to_string()).collect();
    if !errors.is_empty() {
        warn!(?kind, issues = ?errors, "agent response failed schema validation");
        return false;
    }
    true
}

/// Write every embedded schema document to `<state_dir>/schemas/`, so an
/// external agent binary that wants to self-validate its structured
/// output can read the same schema this process enforces.
pub fn write_schemas(state_dir: &Path) -> Result<()> {
    let dir = state_dir.join("schemas");
    std::fs::create_dir_all(&dir).with_context(|| format!("create schema dir {}", dir.display()))?;
    for kind in SchemaKind::ALL {
        let path = dir.join(kind.file_name());
        std::fs::write(&path, kind.source()).with_context(|| format!("write {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_assessment_passes() {
        assert!(validate_response(SchemaKind::Assessment, r#"{"score": 80, "reason": "on track"}"#));
    }

    #[test]
    fn assessment_missing_score_fails() {
        assert!(!validate_response(SchemaKind::Assessment, r#"{"reason": "no score given"}"#));
    }

    #[test]
    fn assessment_score_out_of_range_fails() {
        assert!(!validate_response(SchemaKind::Assessment, r#"{"score": 250}"#));
    }

    #[test]
    fn non_json_response_fails_without_panicking() {
        assert!(!validate_response(SchemaKind::Assessment, "the worker is making good progress"));
    }

    #[test]
    fn plan_review_accepts_missing_optional_arrays() {
        assert!(validate_response(SchemaKind::PlanReview, r#"{"approved": true}"#));
    }

    #[test]
    fn goal_verification_accepts_string_or_bool_achieved() {
        assert!(validate_response(SchemaKind::GoalVerification, r#"{"achieved": true}"#));
        assert!(validate_response(SchemaKind::GoalVerification, r#"{"achieved": "PARTIAL"}"#));
    }

    #[test]
    fn write_schemas_creates_every_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_schemas(temp.path()).expect("write schemas");
        for kind in SchemaKind::ALL {
            assert!(temp.path().join("schemas").join(kind.file_name()).exists());
        }
    }
}
