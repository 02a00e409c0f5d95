//! Debounce / rate-limit state machine.
//!
//! ```text
//!   Idle --change--> Pending --change--> Pending (deadline restarted)
//!                       |
//!                     fire ----rate limited----> Idle
//!                       |
//!                       v
//!                    Running --change--> Running (deferred)
//!                       |
//!                     finish --> Idle
//! ```
//!
//! Pure: callers pass `now` in, so every transition is testable without
//! timers.

use std::time::Duration;

use tokio::time::Instant;

/// How a changed path is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeClass {
    Ignored,
    Standard,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Pending { deadline: Instant, critical: bool },
    Running,
}

/// Result of feeding a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    /// The debounce window is (re)armed and ends at this instant.
    Armed(Instant),
    /// A cycle is in flight; the change is only recorded.
    Deferred,
    Ignored,
}

/// Result of the debounce deadline elapsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireAction {
    /// Start a cycle now.
    Run,
    /// The previous cycle finished too recently; the trigger is dropped.
    RateLimited { wait: Duration },
    /// Nothing pending, or the deadline is still in the future.
    NotDue,
}

#[derive(Debug, Clone)]
pub struct Debouncer {
    debounce: Duration,
    critical_debounce: Duration,
    min_interval: Duration,
    phase: Phase,
    last_finished: Option<Instant>,
}

impl Debouncer {
    pub fn new(debounce: Duration, critical_factor: f64, min_interval: Duration) -> Self {
        let factor = if critical_factor.is_finite() && critical_factor > 0.0 {
            critical_factor.min(1.0)
        } else {
            1.0
        };
        Self {
            debounce,
            critical_debounce: debounce.mul_f64(factor),
            min_interval,
            phase: Phase::Idle,
            last_finished: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_running(&self) -> bool {
        self.phase == Phase::Running
    }

    /// The armed debounce deadline, if a window is open.
    pub fn deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::Pending { deadline, .. } => Some(deadline),
            _ => None,
        }
    }

    pub fn on_change(&mut self, now: Instant, class: ChangeClass) -> ChangeAction {
        if class == ChangeClass::Ignored {
            return ChangeAction::Ignored;
        }

        let critical = match self.phase {
            Phase::Running => return ChangeAction::Deferred,
            Phase::Idle => class == ChangeClass::Critical,
            Phase::Pending { critical, .. } => critical || class == ChangeClass::Critical,
        };
        let window = if critical {
            self.critical_debounce
        } else {
            self.debounce
        };
        let deadline = now + window;
        self.phase = Phase::Pending { deadline, critical };
        ChangeAction::Armed(deadline)
    }

    pub fn fire(&mut self, now: Instant) -> FireAction {
        let Phase::Pending { deadline, .. } = self.phase else {
            return FireAction::NotDue;
        };
        if now < deadline {
            return FireAction::NotDue;
        }

        if let Some(finished) = self.last_finished {
            let earliest = finished + self.min_interval;
            if now < earliest {
                self.phase = Phase::Idle;
                return FireAction::RateLimited {
                    wait: earliest - now,
                };
            }
        }

        self.phase = Phase::Running;
        FireAction::Run
    }

    /// Mark the in-flight cycle complete.
    pub fn finish(&mut self, now: Instant) {
        self.phase = Phase::Idle;
        self.last_finished = Some(now);
    }

    /// Drop any pending window without running it.
    pub fn cancel(&mut self) {
        if matches!(self.phase, Phase::Pending { .. }) {
            self.phase = Phase::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEBOUNCE: Duration = Duration::from_millis(2_000);
    const MIN_INTERVAL: Duration = Duration::from_secs(10);

    fn debouncer() -> Debouncer {
        Debouncer::new(DEBOUNCE, 0.5, MIN_INTERVAL)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_change_arms_window() {
        let t0 = Instant::now();
        let mut d = debouncer();
        assert_eq!(d.on_change(t0, ChangeClass::Standard), ChangeAction::Armed(t0 + DEBOUNCE));
        assert_eq!(d.deadline(), Some(t0 + DEBOUNCE));
    }

    #[test]
    fn test_new_change_restarts_window() {
        let t0 = Instant::now();
        let mut d = debouncer();
        d.on_change(t0, ChangeClass::Standard);
        d.on_change(t0 + ms(1_500), ChangeClass::Standard);

        assert_eq!(d.fire(t0 + ms(2_000)), FireAction::NotDue);
        assert_eq!(d.fire(t0 + ms(3_500)), FireAction::Run);
        assert!(d.is_running());
    }

    #[test]
    fn test_critical_change_shortens_window() {
        let t0 = Instant::now();
        let mut d = debouncer();
        assert_eq!(
            d.on_change(t0, ChangeClass::Critical),
            ChangeAction::Armed(t0 + ms(1_000))
        );
        // A later standard change keeps the critical window.
        assert_eq!(
            d.on_change(t0 + ms(500), ChangeClass::Standard),
            ChangeAction::Armed(t0 + ms(1_500))
        );
    }

    #[test]
    fn test_ignored_change_does_not_arm() {
        let mut d = debouncer();
        assert_eq!(d.on_change(Instant::now(), ChangeClass::Ignored), ChangeAction::Ignored);
        assert_eq!(d.phase(), Phase::Idle);
    }

    #[test]
    fn test_changes_during_run_are_deferred() {
        let t0 = Instant::now();
        let mut d = debouncer();
        d.on_change(t0, ChangeClass::Standard);
        assert_eq!(d.fire(t0 + DEBOUNCE), FireAction::Run);

        assert_eq!(d.on_change(t0 + ms(2_100), ChangeClass::Critical), ChangeAction::Deferred);
        assert_eq!(d.fire(t0 + ms(9_000)), FireAction::NotDue);

        d.finish(t0 + ms(5_000));
        assert_eq!(d.phase(), Phase::Idle);
    }

    #[test]
    fn test_rate_limit_drops_trigger() {
        let t0 = Instant::now();
        let mut d = debouncer();
        d.on_change(t0, ChangeClass::Standard);
        assert_eq!(d.fire(t0 + DEBOUNCE), FireAction::Run);
        d.finish(t0 + ms(3_000));

        d.on_change(t0 + ms(4_000), ChangeClass::Standard);
        assert_eq!(
            d.fire(t0 + ms(6_000)),
            FireAction::RateLimited { wait: ms(7_000) }
        );
        assert_eq!(d.phase(), Phase::Idle);

        // Once the interval has passed, triggers run again.
        d.on_change(t0 + ms(12_000), ChangeClass::Standard);
        assert_eq!(d.fire(t0 + ms(14_000)), FireAction::Run);
    }

    #[test]
    fn test_fire_when_idle_is_not_due() {
        let mut d = debouncer();
        assert_eq!(d.fire(Instant::now()), FireAction::NotDue);
    }

    #[test]
    fn test_bad_factor_falls_back_to_full_window() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(DEBOUNCE, 0.0, MIN_INTERVAL);
        assert_eq!(d.on_change(t0, ChangeClass::Critical), ChangeAction::Armed(t0 + DEBOUNCE));
    }
}
