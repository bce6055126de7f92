//! The impure half of the engine: subprocess agents, the filesystem,
//! child-process execution, and the event stream. Every module here calls
//! into `core` for its actual logic and owns only the side effects.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod agent_driver;
pub mod config;
pub mod context_manager;
pub mod error_recovery;
pub mod events;
pub mod executor;
pub mod persistence;
pub mod planner;
pub mod process;
pub mod schema;
pub mod supervisor;
pub mod verifier;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

/// Milliseconds since the Unix epoch, read once per call site so every
/// other module that needs "now" takes it as a plain `u64` rather than
/// reading the clock itself — keeps `core` and most of `io` unit-testable
/// without mocking time.
pub fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_millis() as u64
}
