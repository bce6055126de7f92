//! Error classification, backoff arithmetic, and circuit-breaker state.
//!
//! Pure logic: classification works over an error message string, backoff
//! is a closed-form computation given an attempt count, and the circuit
//! breaker is an owned struct whose transitions are driven by the caller
//! supplying elapsed time rather than reading a clock itself.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    RateLimit,
    Timeout,
    Context,
    Permission,
    Validation,
    Resource,
    Internal,
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    RetryBackoff,
    RetryExtended,
    TrimContext,
    SkipStep,
    Escalate,
    Abort,
}

/// Classify an error's message text. Order matters: more specific
/// categories are checked before the catch-all `Permanent`.
pub fn classify(message: &str) -> ErrorCategory {
    let lowered = message.to_ascii_lowercase();

    if lowered.contains("rate limit") || lowered.contains("429") || lowered.contains("too many requests") {
        ErrorCategory::RateLimit
    } else if lowered.contains("timed out") || lowered.contains("timeout") || lowered.contains("deadline exceeded") {
        ErrorCategory::Timeout
    } else if lowered.contains("context length") || lowered.contains("token limit") || lowered.contains("context_length_exceeded")
    {
        ErrorCategory::Context
    } else if lowered.contains("permission denied") || lowered.contains("forbidden") || lowered.contains("403") {
        ErrorCategory::Permission
    } else if lowered.contains("parse") || lowered.contains("invalid format") || lowered.contains("malformed") {
        ErrorCategory::Validation
    } else if lowered.contains("no such file") || lowered.contains("enoent") || lowered.contains("not found") {
        ErrorCategory::Resource
    } else if lowered.contains("internal error") || lowered.contains("500") || lowered.contains("502") || lowered.contains("503") {
        ErrorCategory::Internal
    } else if lowered.contains("connection reset") || lowered.contains("broken pipe") || lowered.contains("network") {
        ErrorCategory::Transient
    } else if lowered.contains("unauthorized") || lowered.contains("invalid api key") || lowered.contains("401") {
        ErrorCategory::Permanent
    } else {
        ErrorCategory::Permanent
    }
}

/// The strategy for a category, independent of any particular attempt.
pub fn strategy_for(category: ErrorCategory) -> RecoveryStrategy {
    match category {
        ErrorCategory::Transient | ErrorCategory::RateLimit | ErrorCategory::Timeout | ErrorCategory::Internal => {
            RecoveryStrategy::RetryBackoff
        }
        ErrorCategory::Context => RecoveryStrategy::TrimContext,
        ErrorCategory::Validation => RecoveryStrategy::Escalate,
        ErrorCategory::Resource => RecoveryStrategy::SkipStep,
        ErrorCategory::Permission | ErrorCategory::Permanent => RecoveryStrategy::Abort,
    }
}

/// Exponential backoff with jitter: `base * factor^(attempt - 1)`, capped,
/// then perturbed by up to 20% via the caller-supplied `jitter` in
/// `[0.0, 1.0)` so the computation stays deterministic and testable.
pub fn backoff_delay(base: Duration, factor: f64, attempt: u32, cap: Duration, jitter: f64) -> Duration {
    let attempt = attempt.max(1);
    let raw_ms = base.as_millis() as f64 * factor.powi(attempt as i32 - 1);
    let capped_ms = raw_ms.min(cap.as_millis() as f64);
    let jitter_factor = 1.0 + (jitter.clamp(0.0, 1.0) - 0.5) * 0.4;
    Duration::from_millis((capped_ms * jitter_factor).max(0.0) as u64)
}

/// Per-operation circuit breaker. The caller supplies elapsed time (as
/// milliseconds since an arbitrary fixed epoch) rather than this struct
/// reading a clock itself, so it stays unit-testable. Once tripped, the
/// breaker forces `RecoveryStrategy::Abort` for new calls until
/// `cooldown` has elapsed since the trip, at which point it self-resets
/// to closed (a half-open probe rather than a three-state breaker,
/// matching the spec's "until a cool-down timer fires" wording).
#[derive(Debug, Clone, Default)]
pub struct CircuitBreaker {
    consecutive_failures: u32,
    trip_threshold: u32,
    opened_at_millis: Option<u64>,
}

impl CircuitBreaker {
    pub fn new(trip_threshold: u32) -> Self {
        Self {
            consecutive_failures: 0,
            trip_threshold,
            opened_at_millis: None,
        }
    }

    pub fn record_failure(&mut self, now_millis: u64) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.trip_threshold && self.opened_at_millis.is_none() {
            self.opened_at_millis = Some(now_millis);
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.opened_at_millis = None;
    }

    /// Whether the breaker is currently forcing `Abort`. Self-heals once
    /// `cooldown` has elapsed since the trip: the breaker closes and a new
    /// call is allowed to probe the operation again.
    pub fn is_open(&mut self, now_millis: u64, cooldown: Duration) -> bool {
        match self.opened_at_millis {
            Some(opened) if now_millis.saturating_sub(opened) < cooldown.as_millis() as u64 => true,
            Some(_) => {
                self.opened_at_millis = None;
                self.consecutive_failures = 0;
                false
            }
            None => false,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_error_shapes() {
        assert_eq!(classify("Rate limit exceeded, try again later"), ErrorCategory::RateLimit);
        assert_eq!(classify("request timed out after 30s"), ErrorCategory::Timeout);
        assert_eq!(classify("context_length_exceeded: too many tokens"), ErrorCategory::Context);
        assert_eq!(classify("Permission denied"), ErrorCategory::Permission);
        assert_eq!(classify("failed to parse response: malformed json"), ErrorCategory::Validation);
        assert_eq!(classify("ENOENT: no such file or directory"), ErrorCategory::Resource);
        assert_eq!(classify("500 Internal Server Error"), ErrorCategory::Internal);
        assert_eq!(classify("connection reset by peer"), ErrorCategory::Transient);
        assert_eq!(classify("invalid api key"), ErrorCategory::Permanent);
        assert_eq!(classify("something entirely unexpected"), ErrorCategory::Permanent);
    }

    #[test]
    fn strategy_routes_each_category_per_the_table() {
        assert_eq!(strategy_for(ErrorCategory::Transient), RecoveryStrategy::RetryBackoff);
        assert_eq!(strategy_for(ErrorCategory::Context), RecoveryStrategy::TrimContext);
        assert_eq!(strategy_for(ErrorCategory::Validation), RecoveryStrategy::Escalate);
        assert_eq!(strategy_for(ErrorCategory::Resource), RecoveryStrategy::SkipStep);
        assert_eq!(strategy_for(ErrorCategory::Permanent), RecoveryStrategy::Abort);
    }

    #[test]
    fn backoff_is_monotonically_non_decreasing_up_to_the_cap() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(10);
        let mut previous = Duration::ZERO;
        for attempt in 1..8 {
            let delay = backoff_delay(base, 2.0, attempt, cap, 0.5); // jitter 0.5 => no perturbation
            assert!(delay >= previous);
            previous = delay;
        }
        assert!(previous <= cap);
    }

    #[test]
    fn circuit_breaker_opens_after_the_configured_failure_count() {
        let mut breaker = CircuitBreaker::new(3);
        let cooldown = Duration::from_secs(60);
        breaker.record_failure(0);
        assert!(!breaker.is_open(0, cooldown));
        breaker.record_failure(0);
        assert!(!breaker.is_open(0, cooldown));
        breaker.record_failure(0);
        assert!(breaker.is_open(0, cooldown));
    }

    #[test]
    fn circuit_breaker_resets_on_success() {
        let mut breaker = CircuitBreaker::new(2);
        breaker.record_failure(0);
        breaker.record_success();
        assert_eq!(breaker.consecutive_failures(), 0);
        assert!(!breaker.is_open(0, Duration::from_secs(60)));
    }

    #[test]
    fn circuit_breaker_self_heals_after_the_cooldown_elapses() {
        let mut breaker = CircuitBreaker::new(2);
        let cooldown = Duration::from_secs(10);
        breaker.record_failure(0);
        breaker.record_failure(0);
        assert!(breaker.is_open(0, cooldown));
        assert!(breaker.is_open(9_999, cooldown));
        assert!(!breaker.is_open(10_000, cooldown));
        // Having self-healed, a fresh failure needs the full threshold again.
        breaker.record_failure(10_000);
        assert!(!breaker.is_open(10_000, cooldown));
    }
}
