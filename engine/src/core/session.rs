//! Pure session/checkpoint/metrics record types.
//!
//! These are the shapes persisted to disk by `io::persistence`; this module
//! only owns their definitions and the handful of pure predicates that
//! don't need a clock or the filesystem (e.g. whether a session is still
//! resumable given an already-read "now").

use serde::{Deserialize, Serialize};

use super::types::Plan;

/// Lifecycle state of an orchestration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Aborted,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Aborted)
    }
}

/// One entry in a session's running context log — a compact record of
/// what happened, kept alongside the full conversation history so the
/// event stream and any resumed run can reconstruct a narrative without
/// replaying every agent turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextLogEntry {
    pub kind: LogKind,
    pub step_number: Option<String>,
    pub summary: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Planned,
    StepStarted,
    StepCompleted,
    StepFailed,
    Escalation,
    Recovery,
    GoalVerified,
}

/// Token and turn accounting for a session, independent of any one
/// worker's conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub total_turns: u32,
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub steps_completed: u32,
    pub steps_failed: u32,
    pub escalations: u32,
    pub recoveries: u32,
}

impl Metrics {
    pub fn record_turn(&mut self, tokens_in: u32, tokens_out: u32) {
        self.total_turns += 1;
        self.total_tokens_in += u64::from(tokens_in);
        self.total_tokens_out += u64::from(tokens_out);
    }
}

/// The full resumable state of a session: goal, plan, bookkeeping, and a
/// bounded log of what happened so far. Persisted as one JSON file per
/// session by `io::persistence`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub goal: String,
    pub workdir: String,
    pub status: SessionStatus,
    pub plan: Option<Plan>,
    pub consecutive_issues: u32,
    pub metrics: Metrics,
    pub log: Vec<ContextLogEntry>,
    pub created_at_millis: u64,
    pub updated_at_millis: u64,
}

impl Session {
    pub fn new(session_id: impl Into<String>, goal: impl Into<String>, workdir: impl Into<String>, now_millis: u64) -> Self {
        Self {
            session_id: session_id.into(),
            goal: goal.into(),
            workdir: workdir.into(),
            status: SessionStatus::Running,
            plan: None,
            consecutive_issues: 0,
            metrics: Metrics::default(),
            log: Vec::new(),
            created_at_millis: now_millis,
            updated_at_millis: now_millis,
        }
    }

    /// A paused-but-not-terminal session is resumable; a terminal one is
    /// not regardless of age.
    pub fn is_resumable(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn push_log(&mut self, entry: ContextLogEntry, now_millis: u64) {
        self.log.push(entry);
        self.updated_at_millis = now_millis;
    }
}

/// A point-in-time snapshot taken for rollback, distinct from the live
/// `Session` record — a checkpoint freezes the plan and metrics as they
/// stood after a specific step, so a later regression can be rolled back
/// to it without losing the session's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    pub after_step: String,
    pub plan: Plan,
    pub metrics: Metrics,
    pub created_at_millis: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_session_is_running_and_resumable() {
        let session = Session::new("abc-123", "build a thing", "/workdir", 1000);
        assert_eq!(session.status, SessionStatus::Running);
        assert!(session.is_resumable());
        assert_eq!(session.consecutive_issues, 0);
        assert!(session.log.is_empty());
    }

    #[test]
    fn terminal_statuses_are_not_resumable() {
        let mut session = Session::new("abc-123", "goal", "/workdir", 1000);
        session.status = SessionStatus::Completed;
        assert!(!session.is_resumable());
        session.status = SessionStatus::Failed;
        assert!(!session.is_resumable());
        session.status = SessionStatus::Aborted;
        assert!(!session.is_resumable());
    }

    #[test]
    fn paused_session_remains_resumable() {
        let mut session = Session::new("abc-123", "goal", "/workdir", 1000);
        session.status = SessionStatus::Paused;
        assert!(session.is_resumable());
    }

    #[test]
    fn push_log_appends_and_bumps_updated_at() {
        let mut session = Session::new("abc-123", "goal", "/workdir", 1000);
        session.push_log(
            ContextLogEntry {
                kind: LogKind::Planned,
                step_number: None,
                summary: "plan created".to_string(),
                timestamp: "2026-07-28T00:00:00Z".to_string(),
            },
            2000,
        );
        assert_eq!(session.log.len(), 1);
        assert_eq!(session.updated_at_millis, 2000);
    }

    #[test]
    fn metrics_record_turn_accumulates() {
        let mut metrics = Metrics::default();
        metrics.record_turn(100, 50);
        metrics.record_turn(200, 75);
        assert_eq!(metrics.total_turns, 2);
        assert_eq!(metrics.total_tokens_in, 300);
        assert_eq!(metrics.total_tokens_out, 125);
    }
}
