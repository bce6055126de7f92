//! An autonomous coding orchestration engine: a planner/worker/supervisor
//! trio of agent conversations driven around a decomposable plan, with a
//! bulletproof outer loop (the teacher's `looping.rs`/`step.rs` split,
//! generalized to three cooperating conversations instead of one) and a
//! three-layer completion verifier standing between a worker's claim and
//! the plan advancing.
//!
//! `core` holds every pure, deterministic piece of logic (parsing,
//! scoring, escalation, dependency analysis) with no I/O of its own;
//! `io` wraps it with the side-effecting world: subprocess agents, the
//! filesystem, and the event stream.

pub mod core;
pub mod io;

pub use io::executor::run;
