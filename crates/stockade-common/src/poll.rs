//! Bounded polling helper.
//!
//! The supervisor never blocks unboundedly inside the kernel: state spins
//! (freezer transitions, kill drains) poll a predicate at a fixed
//! granularity up to a deadline.

use std::time::{Duration, Instant};

/// Polls `pred` once per `granularity` until it returns true or `timeout`
/// elapses. Returns true iff the predicate was observed true.
pub fn poll_until(timeout: Duration, granularity: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if pred() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(granularity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_success_does_not_sleep() {
        let start = Instant::now();
        assert!(poll_until(
            Duration::from_secs(5),
            Duration::from_millis(1),
            || true
        ));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn timeout_reports_false() {
        assert!(!poll_until(
            Duration::from_millis(5),
            Duration::from_millis(1),
            || false
        ));
    }

    #[test]
    fn predicate_flip_is_observed() {
        let mut calls = 0;
        let ok = poll_until(Duration::from_millis(200), Duration::from_millis(1), || {
            calls += 1;
            calls >= 3
        });
        assert!(ok);
        assert_eq!(calls, 3);
    }
}
