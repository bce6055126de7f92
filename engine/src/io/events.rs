//! The product-facing event stream.
//!
//! Distinct from `tracing`: this is the typed, append-only record of what
//! the engine did, read by an out-of-core UI rather than an operator's
//! terminal. Grounded in the teacher's `runner-ui` crate (`sse.rs`,
//! `state.rs`), generalized from watching `.runner/state/*.json` file
//! changes to consuming a typed event channel directly: every event is
//! both appended to a JSONL log file under the state directory (so
//! `engine-ui` can tail it the same way `runner-ui` polls `tree.json`) and
//! pushed, best-effort, onto a bounded in-process channel for anything
//! inside this process that wants to observe the stream directly (chiefly
//! integration tests).

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Append-only, typed record emitted by the orchestration engine.
///
/// `#[serde(tag = "type")]` gives each variant a `"type"` discriminator
/// matching the literal event names in the external event-stream
/// contract (e.g. `"step_complete"`). `timestamp` is carried on the
/// envelope, not per-variant, since every event needs exactly one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Initialized { session_id: String, goal: String },
    Started { session_id: String },
    Planning,
    PlanCreated { total_steps: usize },
    PlanReviewStarted,
    PlanReviewComplete { approved: bool, issue_count: usize },
    PlanReviewWarning { issues: Vec<String> },
    Resuming { session_id: String },
    PlanRestored { current_step: Option<String> },
    StepDecomposing { step_number: String },
    StepDecomposed { step_number: String, child_count: usize },
    ParallelBatchStarted { step_numbers: Vec<String> },
    ParallelBatchCompleted { step_numbers: Vec<String> },
    IterationComplete { step_number: Option<String>, cycle: u32 },
    DuplicateResponseDetected { step_number: Option<String> },
    StepVerificationPending { step_number: String },
    StepVerificationStarted { step_number: String },
    StepComplete { step_number: String },
    StepRejected { step_number: String, reason: Option<String> },
    StepBlockedReplanning { step_number: String, reason: String },
    SubplanCreating { step_number: String },
    SubplanCreated { step_number: String, sub_step_count: usize },
    SubplanFailed { step_number: String },
    StepFailed { step_number: String, reason: Option<String> },
    StepBlocked { step_number: String, reason: String },
    StepSkipped { step_number: String, reason: Option<String> },
    VerificationStarted { step_number: String },
    FinalVerificationStarted,
    GoalVerificationComplete { achieved: String, confidence: String },
    SmokeTestsComplete { passed: bool, summary: String },
    FinalVerificationPassed,
    FinalVerificationFailed { gaps: Vec<String> },
    GapPlanCreating { gap_count: usize, failed_step_count: usize },
    GapPlanCreated { step_count: usize, cycle: u32 },
    GapPlanFailed,
    RetryLoopStarted { operation_id: String },
    AttemptStarting { operation_id: String, attempt: u32 },
    AttemptCompleted { operation_id: String, attempt: u32, succeeded: bool },
    RetryLoopCompleted { operation_id: String, succeeded: bool },
    TimeExhausted,
    HistoryCompressed { dropped: usize },
    StrategyAdjusted { strategy: String, operation_id: String },
    Escalation { reason: String, consecutive_issues: u32 },
    Complete { status: String, session_id: String, iterations: u32 },
    FatalError { message: String },
}

/// An event plus the timestamp it was emitted at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp_millis: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Sink that both durably logs events and, best-effort, forwards them to
/// any in-process subscriber.
pub struct EventBus {
    file: Mutex<File>,
    tx: SyncSender<Event>,
    rx: Mutex<Option<Receiver<Event>>>,
}

const CHANNEL_CAPACITY: usize = 256;

impl EventBus {
    /// Open (creating if needed) the JSONL event log at `log_path`.
    pub fn open(log_path: &Path) -> Result<Self> {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create event log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .with_context(|| format!("open event log {}", log_path.display()))?;
        let (tx, rx) = mpsc::sync_channel(CHANNEL_CAPACITY);
        Ok(Self {
            file: Mutex::new(file),
            tx,
            rx: Mutex::new(Some(rx)),
        })
    }

    /// Take the in-process receiver. Only one caller may hold it; later
    /// callers get `None`.
    pub fn take_receiver(&self) -> Option<Receiver<Event>> {
        self.rx.lock().expect("event bus receiver lock poisoned").take()
    }

    /// Append `kind` to the log, stamped with `now_millis`, and forward it
    /// to any in-process subscriber. A full or absent subscriber channel
    /// never blocks or fails emission — the durable log is authoritative.
    pub fn emit(&self, kind: EventKind, now_millis: u64) -> Result<()> {
        let event = Event {
            timestamp_millis: now_millis,
            kind,
        };
        let mut line = serde_json::to_string(&event).context("serialize event")?;
        line.push('\n');

        let mut file = self.file.lock().expect("event log file lock poisoned");
        file.write_all(line.as_bytes()).context("append event log")?;
        file.flush().context("flush event log")?;
        drop(file);

        match self.tx.try_send(event) {
            Ok(()) | Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {}
        }
        Ok(())
    }
}

/// Read every event previously appended to `log_path`, in order. Used by
/// tests and by `engine-ui` to replay history on startup.
pub fn read_event_log(log_path: &Path) -> Result<Vec<Event>> {
    if !log_path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(log_path).with_context(|| format!("read event log {}", log_path.display()))?;
    contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).with_context(|| format!("parse event log line in {}", log_path.display())))
        .collect()
}

#[allow(dead_code)]
fn event_log_path(state_dir: &Path) -> PathBuf {
    state_dir.join("events.jsonl")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emitted_events_are_durably_logged_and_forwarded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log_path = temp.path().join("events.jsonl");
        let bus = EventBus::open(&log_path).expect("open bus");
        let rx = bus.take_receiver().expect("receiver");

        bus.emit(
            EventKind::Initialized {
                session_id: "s1".to_string(),
                goal: "build a thing".to_string(),
            },
            1_000,
        )
        .expect("emit");

        let forwarded = rx.try_recv().expect("forwarded event");
        assert_eq!(forwarded.timestamp_millis, 1_000);

        let logged = read_event_log(&log_path).expect("read log");
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].timestamp_millis, 1_000);
    }

    #[test]
    fn take_receiver_only_succeeds_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let bus = EventBus::open(&temp.path().join("events.jsonl")).expect("open bus");
        assert!(bus.take_receiver().is_some());
        assert!(bus.take_receiver().is_none());
    }

    #[test]
    fn emit_never_blocks_once_the_channel_is_full_and_undrained() {
        let temp = tempfile::tempdir().expect("tempdir");
        let bus = EventBus::open(&temp.path().join("events.jsonl")).expect("open bus");
        // Don't take the receiver; fill the channel well past capacity.
        for i in 0..(CHANNEL_CAPACITY as u64 + 10) {
            bus.emit(EventKind::Planning, i).expect("emit should not block or fail");
        }
    }
}
