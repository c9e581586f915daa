// Copyright 2026 Hybrid Mount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    thread,
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Satisfied,
    TimedOut,
}

/// Polls `check` every `interval` until it returns true or `deadline` elapses.
///
/// The check always runs at least once. A timeout only stops polling; deciding
/// whether to go on is left to the caller.
pub fn poll_until<F>(interval: Duration, deadline: Duration, mut check: F) -> GateOutcome
where
    F: FnMut() -> bool,
{
    let started = Instant::now();
    loop {
        if check() {
            return GateOutcome::Satisfied;
        }
        let elapsed = started.elapsed();
        if elapsed >= deadline {
            return GateOutcome::TimedOut;
        }
        thread::sleep(interval.min(deadline - elapsed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn satisfied_on_first_check() {
        let mut calls = 0;
        let outcome = poll_until(Duration::from_secs(5), Duration::from_secs(5), || {
            calls += 1;
            true
        });
        assert_eq!(outcome, GateOutcome::Satisfied);
        assert_eq!(calls, 1);
    }

    #[test]
    fn satisfied_after_retries() {
        let mut calls = 0;
        let outcome = poll_until(Duration::from_millis(1), Duration::from_secs(5), || {
            calls += 1;
            calls == 3
        });
        assert_eq!(outcome, GateOutcome::Satisfied);
        assert_eq!(calls, 3);
    }

    #[test]
    fn times_out_when_never_satisfied() {
        let started = Instant::now();
        let outcome = poll_until(Duration::from_millis(5), Duration::from_millis(30), || false);
        assert_eq!(outcome, GateOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
