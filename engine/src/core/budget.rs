//! Wall-clock budget arithmetic, lifted verbatim in spirit from the
//! teacher's own time-budget helper: a deadline in, remaining duration
//! out, with no dependency on a timestamp library.

use std::time::{Duration, Instant};

use anyhow::{Result, bail};

/// Time remaining until `deadline`. Errors once the deadline has passed,
/// so callers can treat "no time left" as a distinct condition from "a
/// very short but positive budget."
pub fn remaining_budget(deadline: Instant) -> Result<Duration> {
    let now = Instant::now();
    if now >= deadline {
        bail!("time budget exhausted");
    }
    Ok(deadline - now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_budget_is_positive_before_the_deadline() {
        let deadline = Instant::now() + Duration::from_secs(10);
        let remaining = remaining_budget(deadline).expect("budget remaining");
        assert!(remaining <= Duration::from_secs(10));
        assert!(remaining > Duration::ZERO);
    }

    #[test]
    fn remaining_budget_errors_once_past_the_deadline() {
        let deadline = Instant::now();
        std::thread::sleep(Duration::from_millis(5));
        assert!(remaining_budget(deadline).is_err());
    }
}
