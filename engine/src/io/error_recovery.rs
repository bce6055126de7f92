//! Retry orchestration wrapping [`crate::core::error_classify`].
//!
//! Mirrors the shape of the teacher's guard/executor retry points (spawn,
//! inspect the outcome, decide) but generalized into a single reusable
//! `execute_with_retry` since the engine has several distinct operations
//! (a worker turn, a supervisor check, a planner call) that all need the
//! same classify-then-recover treatment rather than one bespoke retry
//! loop per call site.

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::core::error_classify::{CircuitBreaker, ErrorCategory, RecoveryStrategy, backoff_delay, classify, strategy_for};

/// Configuration for one `execute_with_retry` call.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub operation_id: String,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_factor: f64,
    pub backoff_cap: Duration,
    /// Forces retry-shaped handling for `Escalate` as well as the normal
    /// `RetryBackoff`/`RetryExtended` strategies (the engine's `--retry`
    /// flag). Never overrides `SkipStep` or `Abort`, which name a decision
    /// the classifier made deliberately rather than a transient failure.
    pub force_retry_shaped: bool,
}

/// What happened to one retried operation.
#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub result: Result<T, String>,
    pub attempts: u32,
    pub strategy: Option<RecoveryStrategy>,
    pub circuit_open: bool,
}

/// Per-operation-id circuit breakers, shared across retry calls within one
/// session so repeated failures on the same operation eventually force an
/// abort instead of retrying forever.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: HashMap<String, CircuitBreaker>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn breaker_for(&mut self, operation_id: &str, trip_threshold: u32) -> &mut CircuitBreaker {
        self.breakers.entry(operation_id.to_string()).or_insert_with(|| CircuitBreaker::new(trip_threshold))
    }

    pub fn is_open(&mut self, operation_id: &str, now_millis: u64, cooldown: Duration) -> bool {
        match self.breakers.get_mut(operation_id) {
            Some(breaker) => breaker.is_open(now_millis, cooldown),
            None => false,
        }
    }
}

/// Jitter source so `execute_with_retry` stays deterministic-callable in
/// tests: production callers pass a source that reads real entropy (or
/// wall-clock low bits), tests pass a fixed value.
pub trait JitterSource {
    fn next(&mut self) -> f64;
}

/// Always returns the same value — used by tests and by any caller that
/// wants fully deterministic backoff.
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn next(&mut self) -> f64 {
        self.0
    }
}

/// Reads the clock's sub-millisecond bits as a cheap jitter source for
/// production callers — no need for a full PRNG crate just to perturb a
/// retry delay by up to 20%.
#[derive(Default)]
pub struct SystemJitter;

impl JitterSource for SystemJitter {
    fn next(&mut self) -> f64 {
        let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.subsec_nanos()).unwrap_or(0);
        (nanos % 1000) as f64 / 1000.0
    }
}

/// Run `op` up to `config.max_retries + 1` times, classifying each failure
/// and deciding whether/how long to wait before retrying. Stops early if
/// the operation's circuit breaker is open, or if the classified strategy
/// is not retry-shaped (`SkipStep`, `Escalate`, `Abort`).
///
/// The breaker is checked once per call against `now_millis`/`cooldown`;
/// once it self-heals past `cooldown` a fresh call is allowed to probe the
/// operation again (see [`CircuitBreaker::is_open`]).
///
/// `on_error` is called once per failed attempt (classification, message)
/// so the caller can emit an event or log without this function knowing
/// about the event bus.
#[allow(clippy::too_many_arguments)]
pub fn execute_with_retry<T>(
    config: &RetryConfig,
    breakers: &mut CircuitBreakerRegistry,
    circuit_trip_threshold: u32,
    circuit_cooldown: Duration,
    now_millis: u64,
    jitter: &mut dyn JitterSource,
    mut op: impl FnMut(u32) -> Result<T, String>,
    mut on_error: impl FnMut(u32, ErrorCategory, &str),
) -> RetryOutcome<T> {
    let breaker = breakers.breaker_for(&config.operation_id, circuit_trip_threshold);
    if breaker.is_open(now_millis, circuit_cooldown) {
        warn!(operation_id = %config.operation_id, "circuit breaker open, skipping execution");
        return RetryOutcome {
            result: Err("circuit breaker open".to_string()),
            attempts: 0,
            strategy: Some(RecoveryStrategy::Abort),
            circuit_open: true,
        };
    }

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op(attempt) {
            Ok(value) => {
                breakers.breaker_for(&config.operation_id, circuit_trip_threshold).record_success();
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                    strategy: None,
                    circuit_open: false,
                };
            }
            Err(message) => {
                let category = classify(&message);
                let strategy = strategy_for(category);
                on_error(attempt, category, &message);

                let breaker = breakers.breaker_for(&config.operation_id, circuit_trip_threshold);
                breaker.record_failure(now_millis);
                let circuit_open = breaker.is_open(now_millis, circuit_cooldown);

                let retry_shaped = matches!(strategy, RecoveryStrategy::RetryBackoff | RecoveryStrategy::RetryExtended)
                    || (config.force_retry_shaped && strategy == RecoveryStrategy::Escalate);
                let should_retry = retry_shaped && attempt <= config.max_retries && !circuit_open;

                if !should_retry {
                    return RetryOutcome {
                        result: Err(message),
                        attempts: attempt,
                        strategy: Some(strategy),
                        circuit_open,
                    };
                }

                let delay = backoff_delay(config.backoff_base, config.backoff_factor, attempt, config.backoff_cap, jitter.next());
                info!(operation_id = %config.operation_id, attempt, delay_ms = delay.as_millis() as u64, "retrying after backoff");
                thread::sleep(delay);
            }
        }
    }
}
