//! Bounded per-camera restart accounting.
//!
//! A camera that keeps failing must not be restarted in a tight loop: each
//! restart tears down a decoder child and hits the USB bus. Admission is
//! gated by a per-camera cooldown and a sliding-window cap; exhausting the
//! cap imposes an extended cooldown of twice the window before the history
//! is cleared and one more attempt is allowed.

use std::time::{Duration, Instant};

use crate::config::Config;

/// Gates derived from configuration.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub cooldown: Duration,
    pub window: Duration,
    pub max_per_window: usize,
}

impl RestartPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            cooldown: Duration::from_secs_f64(cfg.restart_cooldown_sec),
            window: Duration::from_secs_f64(cfg.restart_window_sec),
            max_per_window: cfg.max_restarts_per_window,
        }
    }
}

/// Outcome of asking to restart one camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Restart may proceed; the event has been recorded.
    Admitted,
    /// Too soon after the previous restart.
    CoolingDown,
    /// Window cap reached; `first_hit` is true exactly once per episode so
    /// the caller can log the suppression a single time.
    LimitReached { first_hit: bool },
}

/// Sliding-window restart history for one camera slot.
#[derive(Debug, Default)]
pub struct RestartAccounting {
    events: Vec<Instant>,
    last_restart: Option<Instant>,
    limit_hit: bool,
}

impl RestartAccounting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the admission gates at `now`, recording the event when
    /// admitted.
    pub fn admit(&mut self, now: Instant, policy: &RestartPolicy) -> Admission {
        if let Some(last) = self.last_restart
            && now.duration_since(last) < policy.cooldown
        {
            return Admission::CoolingDown;
        }

        let extended = policy.window * 2;
        let within_extended = |last: Option<Instant>| {
            last.is_some_and(|l| now.duration_since(l) < extended)
        };

        // Once the cap has been hit, suppression latches for the whole
        // extended cooldown even as old events age out of the window.
        if self.limit_hit {
            if within_extended(self.last_restart) {
                return Admission::LimitReached { first_hit: false };
            }
            self.events.clear();
            self.limit_hit = false;
        }

        let recent = self
            .events
            .iter()
            .filter(|t| now.duration_since(**t) <= policy.window)
            .count();
        if recent >= policy.max_per_window {
            if within_extended(self.last_restart) {
                self.limit_hit = true;
                return Admission::LimitReached { first_hit: true };
            }
            // Extended cooldown passed: forget the episode entirely.
            self.events.clear();
        }

        self.events.push(now);
        self.last_restart = Some(now);
        // Keep a little more history than one window for the extended check.
        self.events.retain(|t| now.duration_since(*t) <= extended);
        Admission::Admitted
    }

    /// Whether the window cap is currently suppressing restarts.
    pub fn limit_hit(&self) -> bool {
        self.limit_hit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RestartPolicy {
        RestartPolicy {
            cooldown: Duration::from_secs(5),
            window: Duration::from_secs(30),
            max_per_window: 3,
        }
    }

    fn at(base: Instant, secs: u64) -> Instant {
        base + Duration::from_secs(secs)
    }

    #[test]
    fn cooldown_rejects_rapid_retries() {
        let base = Instant::now();
        let mut acc = RestartAccounting::new();
        assert_eq!(acc.admit(at(base, 0), &policy()), Admission::Admitted);
        assert_eq!(acc.admit(at(base, 2), &policy()), Admission::CoolingDown);
        assert_eq!(acc.admit(at(base, 6), &policy()), Admission::Admitted);
    }

    #[test]
    fn window_cap_suppresses_and_logs_once() {
        let base = Instant::now();
        let mut acc = RestartAccounting::new();
        // Three admitted restarts, spaced past the cooldown.
        assert_eq!(acc.admit(at(base, 0), &policy()), Admission::Admitted);
        assert_eq!(acc.admit(at(base, 6), &policy()), Admission::Admitted);
        assert_eq!(acc.admit(at(base, 12), &policy()), Admission::Admitted);
        // Fourth within the window: limit, logged exactly once.
        assert_eq!(
            acc.admit(at(base, 18), &policy()),
            Admission::LimitReached { first_hit: true }
        );
        assert_eq!(
            acc.admit(at(base, 24), &policy()),
            Admission::LimitReached { first_hit: false }
        );
        assert!(acc.limit_hit());
    }

    #[test]
    fn extended_cooldown_allows_one_more_attempt() {
        let base = Instant::now();
        let mut acc = RestartAccounting::new();
        acc.admit(at(base, 0), &policy());
        acc.admit(at(base, 6), &policy());
        acc.admit(at(base, 12), &policy());
        assert!(matches!(
            acc.admit(at(base, 18), &policy()),
            Admission::LimitReached { .. }
        ));
        // Twice the window after the last restart, the episode resets.
        assert_eq!(acc.admit(at(base, 12 + 61), &policy()), Admission::Admitted);
        assert!(!acc.limit_hit());
    }

    #[test]
    fn at_most_max_restarts_in_any_window() {
        let base = Instant::now();
        let p = policy();
        let mut acc = RestartAccounting::new();
        let mut admitted: Vec<u64> = Vec::new();
        for s in (0..120).step_by(6) {
            if acc.admit(at(base, s), &p) == Admission::Admitted {
                admitted.push(s);
            }
        }
        for start in 0..=90 {
            let in_window = admitted
                .iter()
                .filter(|&&s| s >= start && s - start <= 30)
                .count();
            assert!(in_window <= p.max_per_window);
        }
    }

    #[test]
    fn old_events_age_out_of_the_window() {
        let base = Instant::now();
        let mut acc = RestartAccounting::new();
        acc.admit(at(base, 0), &policy());
        acc.admit(at(base, 6), &policy());
        acc.admit(at(base, 12), &policy());
        // 45s later the earliest events are outside the 30s window, so the
        // count is below the cap again.
        assert_eq!(acc.admit(at(base, 45), &policy()), Admission::Admitted);
    }
}
