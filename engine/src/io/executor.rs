//! The outer/inner control loop driving one orchestration session.
//!
//! Structurally modeled on the teacher's `looping.rs` (an outer loop
//! driving repeated calls into `step.rs`'s single-iteration `run_step`):
//! [`run`] is the outer loop across the whole plan and [`run_turn`] is one
//! inner iteration against the current step. The load-bearing difference
//! from the teacher is that this loop drives three cooperating agent
//! conversations (worker, supervisor, planner) instead of one, and must
//! never let a single bad turn end the run — every failure path routes
//! through [`crate::io::error_recovery`] or an explicit skip/replan
//! rather than propagating an error out of [`run`].

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{info, warn};

use crate::core::budget::remaining_budget;
use crate::core::error_classify::RecoveryStrategy;
use crate::core::selector::{current_step, derive_decomposed_statuses, next_executable_batch, ready_steps};
use crate::core::sentinel::{is_goal_completion_signal, is_step_complete, step_blocked_reason};
use crate::core::session::{Checkpoint, ContextLogEntry, LogKind, Session, SessionStatus};
use crate::core::supervisor::Action;
use crate::core::tri::Confidence;
use crate::core::types::{Complexity, Step, StepStatus};
use crate::io::agent_driver::AgentDriver;
use crate::io::config::EngineConfig;
use crate::io::context_manager::{ContextInputs, DuplicateDetector, assemble};
use crate::io::error_recovery::{CircuitBreakerRegistry, RetryConfig, SystemJitter, execute_with_retry};
use crate::io::events::{EventBus, EventKind};
use crate::io::persistence::{SessionCaches, StatePersistence};
use crate::io::{now_millis, planner, supervisor, verifier};

/// Every prompt template the three agent roles are driven with. Plain
/// strings with `{placeholder}` substitution, the same convention
/// `io::planner`/`io::supervisor` already expect.
pub struct PromptTemplates {
    pub planner_system_context: String,
    pub planner_create: String,
    pub planner_decompose: String,
    pub planner_sub_plan: String,
    pub planner_gap_plan: String,
    pub plan_review: String,
    pub supervisor_check: String,
    pub supervisor_verify_step: String,
    pub supervisor_verify_goal: String,
    pub worker_system_context: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            planner_system_context: "You are the planning agent for an autonomous coding session.".to_string(),
            planner_create: "Produce a step-by-step plan to achieve this goal: {goal}".to_string(),
            planner_decompose: "Step {step_number} is too complex to execute directly: {description}\nBreak it into a short ordered list of smaller sub-steps.".to_string(),
            planner_sub_plan: "Step {step_number} is blocked: {description}\nReason: {reason}\nPropose a small ordered salvage plan that retries the same objective a different way.".to_string(),
            planner_gap_plan: "Goal: {goal}\nThe plan so far did not fully achieve the goal.\nReported gaps:\n{gaps}\nFailed steps:\n{failed_steps}\nPropose a short ordered list of additional steps that close these gaps.".to_string(),
            plan_review: "Goal: {goal}\nProposed plan:\n{steps}\nReview this plan for gaps or risks.".to_string(),
            supervisor_check: "Review the worker's latest turn on step {step_number}.\nWorker response:\n{worker_response}".to_string(),
            supervisor_verify_step: "The worker claims step {step_number} is complete.\nResponse:\n{claimed_response}\nVerify this claim.".to_string(),
            supervisor_verify_goal: "Goal: {goal}\nPlan summary:\n{plan_summary}\nHas the goal been fully achieved?".to_string(),
            worker_system_context: "You are the worker agent executing one step at a time toward a larger goal.".to_string(),
        }
    }
}

/// The three cooperating agent conversations this executor drives.
pub struct Drivers<'a> {
    pub worker: &'a mut dyn AgentDriver,
    pub supervisor: &'a mut dyn AgentDriver,
    pub planner: &'a mut dyn AgentDriver,
}

/// What happened in one inner-loop iteration against the current step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    StepCompleted { step_number: String },
    StepRejected { step_number: String, reason: String },
    StepBlocked { step_number: String, reason: String },
    StepSkipped { step_number: String, reason: String },
    NothingReady,
    Aborted { reason: String },
}

struct RunCtx<'a> {
    workdir: &'a Path,
    engine_config: &'a EngineConfig,
    templates: &'a PromptTemplates,
    caches: SessionCaches,
    duplicates: DuplicateDetector,
    breakers: CircuitBreakerRegistry,
}

fn emit(event_bus: &EventBus, kind: EventKind) {
    if let Err(e) = event_bus.emit(kind, now_millis()) {
        warn!(err = %e, "failed to emit event");
    }
}

/// Run one inner-loop iteration: pick the current step, send it a turn,
/// have the supervisor check the result, and react to any completion or
/// blocked signal. Returns `Ok(TurnOutcome::NothingReady)` when the plan
/// has no executable leaf left (the outer loop treats this as "done with
/// this cycle", not an error).
fn run_turn(session: &mut Session, drivers: &mut Drivers, ctx: &mut RunCtx, event_bus: &EventBus) -> Result<TurnOutcome> {
    {
        let plan = session.plan.as_mut().expect("run_turn called without a plan");
        derive_decomposed_statuses(plan);
    }

    let Some(mut step) = current_step(session.plan.as_ref().expect("plan present")).cloned() else {
        return Ok(TurnOutcome::NothingReady);
    };

    if step.start_time.is_none() {
        step.start_time = Some(now_millis().to_string());
        if let Some(s) = session.plan.as_mut().and_then(|p| p.find_mut(&step.number)) {
            s.start_time = step.start_time.clone();
        }
    }

    let running_too_long = step
        .start_time
        .as_deref()
        .and_then(|started| started.parse::<u64>().ok())
        .is_some_and(|started| now_millis().saturating_sub(started) > ctx.engine_config.slow_step_threshold_secs * 1000);

    if (step.complexity == Complexity::Complex || running_too_long) && !step.decompose_attempted {
        emit(
            event_bus,
            EventKind::StepDecomposing {
                step_number: step.number.clone(),
            },
        );
        match planner::decompose_step(drivers.planner, &step, &ctx.templates.planner_decompose) {
            Ok(children) if !children.is_empty() => {
                let child_count = children.len();
                let child_numbers: Vec<String> = children.iter().map(|c| c.number.clone()).collect();
                let plan = session.plan.as_mut().expect("plan still present");
                if let Some(s) = plan.find_mut(&step.number) {
                    s.status = StepStatus::Decomposed;
                    s.decomposed_into = child_numbers;
                }
                plan.steps.extend(children);
                emit(
                    event_bus,
                    EventKind::StepDecomposed {
                        step_number: step.number.clone(),
                        child_count,
                    },
                );
                return Ok(TurnOutcome::NothingReady);
            }
            _ => {
                // Decomposition produced nothing usable; mark attempted so
                // this step executes directly instead of re-decomposing
                // every subsequent turn.
                if let Some(s) = session.plan.as_mut().and_then(|p| p.find_mut(&step.number)) {
                    s.decompose_attempted = true;
                }
            }
        }
    }

    emit(
        event_bus,
        EventKind::IterationComplete {
            step_number: Some(step.number.clone()),
            cycle: session.metrics.total_turns,
        },
    );

    let recent_decisions: Vec<String> = session
        .log
        .iter()
        .rev()
        .filter(|e| e.kind == LogKind::Recovery || e.kind == LogKind::Escalation)
        .take(5)
        .map(|e| e.summary.clone())
        .collect();
    let history: Vec<crate::core::context_score::Message> = drivers.worker.history().to_vec();
    if history.len() > ctx.engine_config.context_compress_threshold {
        emit(
            event_bus,
            EventKind::HistoryCompressed {
                dropped: history.len().saturating_sub(ctx.engine_config.context_keep_recent),
            },
        );
    }

    let plan = session.plan.as_mut().expect("plan still present");
    let inputs = ContextInputs {
        goal: &session.goal,
        plan,
        current_step: plan.find(&step.number),
        recent_decisions: &recent_decisions,
        history: &history,
    };
    let pack = assemble(&inputs, ctx.engine_config.context_token_budget as usize * 4, ctx.engine_config.context_keep_recent, ctx.engine_config.context_token_budget);

    let retry_config = RetryConfig {
        operation_id: "worker_turn".to_string(),
        max_retries: ctx.engine_config.max_retries,
        backoff_base: ctx.engine_config.backoff_base(),
        backoff_factor: ctx.engine_config.backoff_factor,
        backoff_cap: ctx.engine_config.backoff_cap(),
        force_retry_shaped: ctx.engine_config.force_retry,
    };
    let worker = &mut *drivers.worker;
    emit(
        event_bus,
        EventKind::RetryLoopStarted {
            operation_id: retry_config.operation_id.clone(),
        },
    );
    let outcome = execute_with_retry(
        &retry_config,
        &mut ctx.breakers,
        ctx.engine_config.circuit_breaker_threshold,
        Duration::from_secs(ctx.engine_config.circuit_breaker_cooldown_secs),
        now_millis(),
        &mut SystemJitter,
        |attempt| {
            emit(
                event_bus,
                EventKind::AttemptStarting {
                    operation_id: "worker_turn".to_string(),
                    attempt,
                },
            );
            let result = if worker.has_active_session() {
                worker.continue_session(&pack.prompt)
            } else {
                worker.start_session(&ctx.templates.worker_system_context, &pack.prompt)
            };
            result.map_err(|e| e.to_string())
        },
        |attempt, category, message| {
            warn!(attempt, ?category, err = %message, step = %step.number, "worker turn attempt failed");
            emit(
                event_bus,
                EventKind::AttemptCompleted {
                    operation_id: "worker_turn".to_string(),
                    attempt,
                    succeeded: false,
                },
            );
        },
    );
    if outcome.result.is_ok() {
        emit(
            event_bus,
            EventKind::AttemptCompleted {
                operation_id: "worker_turn".to_string(),
                attempt: outcome.attempts,
                succeeded: true,
            },
        );
    }
    emit(
        event_bus,
        EventKind::RetryLoopCompleted {
            operation_id: "worker_turn".to_string(),
            succeeded: outcome.result.is_ok(),
        },
    );

    let turn = match outcome.result {
        Ok(turn) => turn,
        Err(e) => {
            if outcome.strategy == Some(RecoveryStrategy::SkipStep) {
                let plan = session.plan.as_mut().expect("plan still present");
                if let Some(s) = plan.find_mut(&step.number) {
                    s.status = StepStatus::Skipped;
                    s.fail_reason = Some(e.clone());
                }
                return Ok(TurnOutcome::StepSkipped {
                    step_number: step.number.clone(),
                    reason: e,
                });
            }
            return Ok(TurnOutcome::StepRejected {
                step_number: step.number.clone(),
                reason: format!("worker turn failed after {} attempt(s): {e}", outcome.attempts),
            });
        }
    };
    session.metrics.record_turn(turn.tokens_in, turn.tokens_out);

    if ctx.duplicates.observe(&turn.response) {
        emit(
            event_bus,
            EventKind::DuplicateResponseDetected {
                step_number: Some(step.number.clone()),
            },
        );
    }

    if let Some(reason) = step_blocked_reason(&turn.response) {
        return Ok(TurnOutcome::StepBlocked {
            step_number: step.number.clone(),
            reason,
        });
    }

    let assessment = supervisor::check(
        drivers.supervisor,
        &mut ctx.caches.assessment,
        &step.number,
        &turn.response,
        session.consecutive_issues,
        &ctx.templates.supervisor_check,
    );
    if crate::core::supervisor::resets_consecutive_issues(assessment.action) {
        if session.consecutive_issues > 0 {
            emit(
                event_bus,
                EventKind::StrategyAdjusted {
                    strategy: "shrink_delay".to_string(),
                    operation_id: "turn_delay".to_string(),
                },
            );
        }
        session.consecutive_issues = 0;
    } else {
        session.consecutive_issues += 1;
        emit(
            event_bus,
            EventKind::StrategyAdjusted {
                strategy: "grow_delay".to_string(),
                operation_id: "turn_delay".to_string(),
            },
        );
    }
    match assessment.action {
        Action::Abort => {
            return Ok(TurnOutcome::Aborted {
                reason: assessment.reason.unwrap_or_else(|| "supervisor escalated to abort".to_string()),
            });
        }
        Action::Critical | Action::Refocus | Action::Correct | Action::Remind => {
            session.metrics.escalations += 1;
            emit(
                event_bus,
                EventKind::Escalation {
                    reason: assessment.reason.clone().unwrap_or_default(),
                    consecutive_issues: session.consecutive_issues,
                },
            );
        }
        Action::Continue => {}
    }

    if !is_step_complete(&turn.response) {
        return Ok(TurnOutcome::NothingReady);
    }

    emit(
        event_bus,
        EventKind::StepVerificationStarted {
            step_number: step.number.clone(),
        },
    );
    let verification = verifier::verify(ctx.workdir, &turn.response, &session.goal, ctx.engine_config.worker_timeout(), ctx.engine_config.output_limit_bytes)?;
    let step_verification = supervisor::verify_step_completion(drivers.supervisor, &step.number, &turn.response, &ctx.templates.supervisor_verify_step);

    if verification.overall_passed() && step_verification.verified {
        let plan = session.plan.as_mut().expect("plan still present");
        if let Some(s) = plan.find_mut(&step.number) {
            s.status = StepStatus::Completed;
            s.end_time = Some(now_millis().to_string());
        }
        session.metrics.steps_completed += 1;
        Ok(TurnOutcome::StepCompleted { step_number: step.number })
    } else {
        let plan = session.plan.as_mut().expect("plan still present");
        if let Some(s) = plan.find_mut(&step.number) {
            s.fail_reason = Some(verifier::rejection_prompt(&verification));
        }
        Ok(TurnOutcome::StepRejected {
            step_number: step.number.clone(),
            reason: verifier::rejection_prompt(&verification),
        })
    }
}

/// Drive as many independently-ready steps as the worker pool allows in
/// one batch, recording the set in the event stream. Sequential within
/// this call (the subprocess agent driver is not internally thread-safe
/// across roles), but the selection logic matches what a true parallel
/// pool would pick.
fn run_parallel_batch(session: &mut Session, drivers: &mut Drivers, ctx: &mut RunCtx, event_bus: &EventBus) -> Result<Vec<TurnOutcome>> {
    let completed: HashSet<String> = session
        .plan
        .as_ref()
        .map(|p| p.steps.iter().filter(|s| s.status == StepStatus::Completed).map(|s| s.number.clone()).collect())
        .unwrap_or_default();
    let plan = session.plan.as_ref().expect("plan present");
    let ready = ready_steps(plan, &completed);
    let batch = next_executable_batch(&ready, ctx.engine_config.worker_pool_size);
    let numbers: Vec<String> = batch.iter().map(|s| s.number.clone()).collect();

    if numbers.len() > 1 {
        emit(event_bus, EventKind::ParallelBatchStarted { step_numbers: numbers.clone() });
    }

    let mut outcomes = Vec::new();
    for _ in &numbers {
        outcomes.push(run_turn(session, drivers, ctx, event_bus)?);
    }

    if numbers.len() > 1 {
        emit(event_bus, EventKind::ParallelBatchCompleted { step_numbers: numbers });
    }
    Ok(outcomes)
}

/// The full orchestration run: plan (or resume), drive the worker/
/// supervisor loop to exhaustion or budget, then run final goal
/// verification and smoke tests. Every internal error is absorbed into a
/// `Failed`/`Aborted` session status rather than returned — the only
/// `Err` this function returns is a persistence I/O failure, since a
/// session that can't be saved can't usefully continue either way.
pub fn run(goal: &str, workdir: &Path, engine_config: &EngineConfig, templates: &PromptTemplates, persistence: &StatePersistence, event_bus: &EventBus, drivers: &mut Drivers, shutdown: &Arc<AtomicBool>, deadline: Instant, resume_session_id: Option<&str>) -> Result<Session> {
    persistence.initialize()?;

    let mut session = match resume_session_id {
        Some(id) => {
            emit(event_bus, EventKind::Resuming { session_id: id.to_string() });
            let session = persistence.load_session(id)?;
            emit(
                event_bus,
                EventKind::PlanRestored {
                    current_step: session.plan.as_ref().and_then(|p| current_step(p)).map(|s| s.number.clone()),
                },
            );
            session
        }
        None => {
            let canonical_workdir = workdir.to_string_lossy().to_string();
            let session_id = crate::core::session_id::derive(goal, &canonical_workdir, u128::from(now_millis()));
            emit(
                event_bus,
                EventKind::Initialized {
                    session_id: session_id.clone(),
                    goal: goal.to_string(),
                },
            );
            let session = Session::new(session_id.clone(), goal, canonical_workdir, now_millis());
            persistence.start_session(&session)?;
            emit(event_bus, EventKind::Started { session_id });
            session
        }
    };

    if session.plan.is_none() {
        emit(event_bus, EventKind::Planning);
        let plan = planner::create_plan(drivers.planner, &templates.planner_system_context, goal, &templates.planner_create)?;
        emit(event_bus, EventKind::PlanCreated { total_steps: plan.total_steps() });

        emit(event_bus, EventKind::PlanReviewStarted);
        let review = supervisor::review_plan(drivers.supervisor, &plan, goal, &templates.plan_review);
        emit(
            event_bus,
            EventKind::PlanReviewComplete {
                approved: review.approved,
                issue_count: review.issues.len(),
            },
        );
        if !review.issues.is_empty() {
            emit(event_bus, EventKind::PlanReviewWarning { issues: review.issues.clone() });
        }

        session.plan = Some(plan);
        session.push_log(
            ContextLogEntry {
                kind: LogKind::Planned,
                step_number: None,
                summary: format!("plan created with {} steps", session.plan.as_ref().unwrap().total_steps()),
                timestamp: now_millis().to_string(),
            },
            now_millis(),
        );
        persistence.write_session(&session)?;
    }

    let mut caches = SessionCaches::new(engine_config.cache_capacity, Duration::from_secs(engine_config.cache_ttl_secs));
    let mut duplicates = DuplicateDetector::new(engine_config.duplicate_window_size);
    let mut breakers = CircuitBreakerRegistry::new();
    let mut cycles: u32 = 0;

    'outer: loop {
        if shutdown.load(Ordering::SeqCst) {
            session.status = SessionStatus::Paused;
            break;
        }
        if remaining_budget(deadline).is_err() {
            emit(event_bus, EventKind::TimeExhausted);
            session.status = SessionStatus::Paused;
            break;
        }
        if cycles >= engine_config.max_cycles {
            break;
        }
        cycles += 1;

        let mut ctx = RunCtx {
            workdir,
            engine_config,
            templates,
            caches: std::mem::replace(&mut caches, SessionCaches::new(0, Duration::ZERO)),
            duplicates: std::mem::replace(&mut duplicates, DuplicateDetector::new(1)),
            breakers: std::mem::take(&mut breakers),
        };

        let outcomes = run_parallel_batch(&mut session, drivers, &mut ctx, event_bus);
        caches = ctx.caches;
        duplicates = ctx.duplicates;
        breakers = ctx.breakers;
        let outcomes = outcomes?;

        if outcomes.is_empty() {
            let all_terminal = {
                let plan = session.plan.as_ref().expect("plan present");
                plan.steps.iter().all(|s| s.status.is_terminal() || s.status == StepStatus::Decomposed)
            };
            if !all_terminal {
                // Nothing ready and nothing terminal: the plan is stuck.
                break;
            }

            let plan_summary = {
                let plan = session.plan.as_ref().expect("plan present");
                plan.steps.iter().map(|s| format!("{} [{:?}]: {}", s.number, s.status, s.description)).collect::<Vec<_>>().join("\n")
            };
            let verification = supervisor::verify_goal_achieved(drivers.supervisor, &session.goal, &plan_summary, &templates.supervisor_verify_goal);
            emit(
                event_bus,
                EventKind::GoalVerificationComplete {
                    achieved: format!("{:?}", verification.achieved).to_uppercase(),
                    confidence: format!("{:?}", verification.confidence).to_uppercase(),
                },
            );

            if verification.achieved.is_truthy() && verification.confidence == Confidence::High {
                break;
            }
            if cycles >= engine_config.max_cycles {
                break;
            }

            let failed_steps: Vec<Step> = {
                let plan = session.plan.as_ref().expect("plan present");
                plan.steps.iter().filter(|s| s.status == StepStatus::Failed).cloned().collect()
            };
            emit(
                event_bus,
                EventKind::GapPlanCreating {
                    gap_count: verification.gaps.len(),
                    failed_step_count: failed_steps.len(),
                },
            );
            let next_sequence = session.plan.as_ref().expect("plan present").next_sequence;
            match planner::create_gap_plan(drivers.planner, &session.goal, &verification.gaps, &failed_steps, next_sequence, &templates.planner_gap_plan) {
                Ok((gap_steps, new_sequence)) if !gap_steps.is_empty() => {
                    let step_count = gap_steps.len();
                    let plan = session.plan.as_mut().expect("plan present");
                    plan.steps.extend(gap_steps);
                    plan.next_sequence = new_sequence;
                    emit(event_bus, EventKind::GapPlanCreated { step_count, cycle: cycles });
                    drivers.worker.reset();
                    session.push_log(
                        ContextLogEntry {
                            kind: LogKind::Planned,
                            step_number: None,
                            summary: format!("gap plan added {step_count} step(s) after cycle {cycles}"),
                            timestamp: now_millis().to_string(),
                        },
                        now_millis(),
                    );
                    persistence.write_session(&session)?;
                    continue 'outer;
                }
                _ => {
                    emit(event_bus, EventKind::GapPlanFailed);
                    break;
                }
            }
        }

        for outcome in outcomes {
            match outcome {
                TurnOutcome::StepCompleted { step_number } => {
                    emit(event_bus, EventKind::StepComplete { step_number: step_number.clone() });
                    persistence.create_checkpoint(&session, &step_number, now_millis())?;
                }
                TurnOutcome::StepRejected { step_number, reason } => {
                    emit(event_bus, EventKind::StepRejected { step_number, reason: Some(reason) });
                }
                TurnOutcome::StepSkipped { step_number, reason } => {
                    emit(event_bus, EventKind::StepSkipped { step_number, reason: Some(reason) });
                }
                TurnOutcome::StepBlocked { step_number, reason } => {
                    emit(
                        event_bus,
                        EventKind::StepBlockedReplanning {
                            step_number: step_number.clone(),
                            reason: reason.clone(),
                        },
                    );
                    handle_blocked_step(&mut session, drivers, templates, &step_number, &reason, event_bus)?;
                }
                TurnOutcome::Aborted { reason } => {
                    // Supervisor ABORT sets the shutdown reason to persistent
                    // drift, but the run still owes one final summary turn
                    // before it stops (distinct from an ErrorRecovery ABORT,
                    // which must never end the outer loop at all).
                    emit(event_bus, EventKind::FatalError { message: reason.clone() });
                    session.push_log(
                        ContextLogEntry {
                            kind: LogKind::Escalation,
                            step_number: None,
                            summary: format!("persistent drift: {reason}"),
                            timestamp: now_millis().to_string(),
                        },
                        now_millis(),
                    );
                    let _ = finalize(&mut session, drivers, templates, workdir, engine_config, event_bus);
                    session.status = SessionStatus::Aborted;
                    persistence.write_session(&session)?;
                    break 'outer;
                }
                TurnOutcome::NothingReady => {}
            }
        }

        persistence.write_session(&session)?;
    }

    if session.status == SessionStatus::Running {
        finalize(&mut session, drivers, templates, workdir, engine_config, event_bus)?;
    }

    persistence.write_session(&session)?;
    emit(
        event_bus,
        EventKind::Complete {
            status: format!("{:?}", session.status).to_lowercase(),
            session_id: session.session_id.clone(),
            iterations: session.metrics.total_turns,
        },
    );
    Ok(session)
}

fn handle_blocked_step(session: &mut Session, drivers: &mut Drivers, templates: &PromptTemplates, step_number: &str, reason: &str, event_bus: &EventBus) -> Result<()> {
    let plan = session.plan.as_mut().expect("plan present");
    let Some(step) = plan.find(step_number).cloned() else {
        return Ok(());
    };
    if step.sub_planned {
        if let Some(s) = plan.find_mut(step_number) {
            s.status = StepStatus::Failed;
            s.fail_reason = Some(reason.to_string());
        }
        session.metrics.steps_failed += 1;
        emit(
            event_bus,
            EventKind::StepFailed {
                step_number: step_number.to_string(),
                reason: Some(reason.to_string()),
            },
        );
        return Ok(());
    }

    emit(
        event_bus,
        EventKind::SubplanCreating {
            step_number: step_number.to_string(),
        },
    );
    match planner::create_sub_plan(drivers.planner, &step, reason, &templates.planner_sub_plan) {
        Ok(sub_plan) if !sub_plan.steps.is_empty() => {
            let plan = session.plan.as_mut().expect("plan present");
            let child_count = sub_plan.steps.len();
            if let Some(s) = plan.find_mut(step_number) {
                s.status = StepStatus::Decomposed;
                s.decomposed_into = sub_plan.steps.iter().map(|c| c.number.clone()).collect();
                s.sub_planned = true;
            }
            plan.steps.extend(sub_plan.steps);
            emit(
                event_bus,
                EventKind::SubplanCreated {
                    step_number: step_number.to_string(),
                    sub_step_count: child_count,
                },
            );
        }
        _ => {
            emit(
                event_bus,
                EventKind::SubplanFailed {
                    step_number: step_number.to_string(),
                },
            );
            let plan = session.plan.as_mut().expect("plan present");
            if let Some(s) = plan.find_mut(step_number) {
                s.status = StepStatus::Failed;
                s.fail_reason = Some(reason.to_string());
            }
            session.metrics.steps_failed += 1;
            emit(
                event_bus,
                EventKind::StepFailed {
                    step_number: step_number.to_string(),
                    reason: Some(reason.to_string()),
                },
            );
        }
    }
    Ok(())
}

fn finalize(session: &mut Session, drivers: &mut Drivers, templates: &PromptTemplates, workdir: &Path, engine_config: &EngineConfig, event_bus: &EventBus) -> Result<()> {
    emit(event_bus, EventKind::FinalVerificationStarted);
    let plan = session.plan.as_ref().expect("plan present");
    let plan_summary = plan.steps.iter().map(|s| format!("{} [{:?}]: {}", s.number, s.status, s.description)).collect::<Vec<_>>().join("\n");

    let goal_verification = supervisor::verify_goal_achieved(drivers.supervisor, &session.goal, &plan_summary, &templates.supervisor_verify_goal);
    emit(
        event_bus,
        EventKind::GoalVerificationComplete {
            achieved: format!("{:?}", goal_verification.achieved).to_uppercase(),
            confidence: format!("{:?}", goal_verification.confidence).to_uppercase(),
        },
    );

    let last_response = drivers.worker.history().last().map(|m| m.content.clone()).unwrap_or_default();
    let evidence = crate::core::verification::parse_evidence(&last_response);
    let (smoke_passed, smoke_summary) = verifier::run_smoke_tests(workdir, &evidence, engine_config.worker_timeout(), engine_config.output_limit_bytes)?;
    emit(
        event_bus,
        EventKind::SmokeTestsComplete {
            passed: smoke_passed,
            summary: smoke_summary,
        },
    );

    let goal_signal = is_goal_completion_signal(&last_response);
    if goal_verification.achieved.is_truthy() && smoke_passed && goal_signal {
        emit(event_bus, EventKind::FinalVerificationPassed);
        session.status = SessionStatus::Completed;
    } else if goal_verification.achieved.is_falsy() || !smoke_passed {
        emit(event_bus, EventKind::FinalVerificationFailed { gaps: goal_verification.gaps.clone() });
        session.status = SessionStatus::Failed;
        session.metrics.steps_failed += 1;
    } else {
        // Inconclusive: every step is terminal but the goal can't be
        // confidently confirmed. Treat conservatively as completed, since
        // every individual step already passed its own three-layer check.
        session.status = SessionStatus::Completed;
    }
    session.push_log(
        ContextLogEntry {
            kind: LogKind::GoalVerified,
            step_number: None,
            summary: goal_verification.reason.unwrap_or_default(),
            timestamp: now_millis().to_string(),
        },
        now_millis(),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::persistence::StatePersistence;
    use crate::io::test_support::ScriptedAgentDriver;

    fn deadline_in(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[test]
    fn a_single_step_goal_completes_end_to_end() {
        let temp = tempfile::tempdir().expect("tempdir");
        let workdir = temp.path();
        std::fs::write(workdir.join("lib.rs"), b"fn main() {}").expect("seed file");

        let persistence = StatePersistence::new(workdir.join(".state"), 10);
        let event_log = workdir.join(".state").join("events.jsonl");
        let event_bus = EventBus::open(&event_log).expect("open event bus");

        let mut planner_driver = ScriptedAgentDriver::new(vec!["PLAN:\n1. write a small file | simple\nTOTAL_STEPS: 1\n".to_string()]);
        let mut supervisor_driver = ScriptedAgentDriver::new(vec![
            r#"{"approved": true}"#.to_string(),
            r#"{"score": 90}"#.to_string(),
            r#"{"verified": true}"#.to_string(),
            r#"{"achieved": true, "confidence": "HIGH"}"#.to_string(),
        ]);
        let mut worker_driver = ScriptedAgentDriver::new(vec!["I created `lib.rs`. Ran `true` to check. STEP COMPLETE. TASK COMPLETE.".to_string()]);

        let mut drivers = Drivers {
            worker: &mut worker_driver,
            supervisor: &mut supervisor_driver,
            planner: &mut planner_driver,
        };

        let engine_config = EngineConfig::default();
        let templates = PromptTemplates::default();
        let shutdown = Arc::new(AtomicBool::new(false));

        let session = run(
            "write a small file",
            workdir,
            &engine_config,
            &templates,
            &persistence,
            &event_bus,
            &mut drivers,
            &shutdown,
            deadline_in(30),
            None,
        )
        .expect("run completes");

        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.metrics.steps_completed, 1);
    }

    #[test]
    fn an_abort_escalation_ends_the_run_as_aborted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let workdir = temp.path();
        let persistence = StatePersistence::new(workdir.join(".state"), 10);
        let event_bus = EventBus::open(&workdir.join(".state").join("events.jsonl")).expect("open event bus");

        let mut planner_driver = ScriptedAgentDriver::new(vec!["PLAN:\n1. do a risky thing | medium\nTOTAL_STEPS: 1\n".to_string()]);
        let mut supervisor_driver = ScriptedAgentDriver::new(vec![
            r#"{"approved": true}"#.to_string(),
            r#"{"score": 0}"#.to_string(),
            r#"{"score": 0}"#.to_string(),
            r#"{"score": 0}"#.to_string(),
            r#"{"score": 0}"#.to_string(),
            r#"{"score": 0}"#.to_string(),
        ]);
        let mut worker_driver = ScriptedAgentDriver::new(vec![
            "still working".to_string(),
            "still working part 2".to_string(),
            "still working part 3".to_string(),
            "still working part 4".to_string(),
            "still working part 5".to_string(),
        ]);

        let mut drivers = Drivers {
            worker: &mut worker_driver,
            supervisor: &mut supervisor_driver,
            planner: &mut planner_driver,
        };

        let engine_config = EngineConfig::default();
        let templates = PromptTemplates::default();
        let shutdown = Arc::new(AtomicBool::new(false));

        let session = run(
            "do a risky thing",
            workdir,
            &engine_config,
            &templates,
            &persistence,
            &event_bus,
            &mut drivers,
            &shutdown,
            deadline_in(30),
            None,
        )
        .expect("run returns even on abort");

        assert_eq!(session.status, SessionStatus::Aborted);
    }
}
