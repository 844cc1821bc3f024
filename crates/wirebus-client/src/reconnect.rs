//! Reconnection backoff schedule.
//!
//! Triggered only on unexpected disconnects; an explicit `disconnect()`
//! short-circuits the controller entirely. On success the schedule is
//! discarded, which resets the attempt counter for the next outage.

use std::time::Duration;

/// Backoff parameters: delay doubles per attempt up to `max_delay`, and
/// after `max_attempts` failures the client gives up until an explicit
/// `connect()`.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

/// Mutable state for one outage: attempt count and current delay.
#[derive(Debug, Default)]
pub struct ReconnectSchedule {
    attempts: u32,
    current: Option<Duration>,
}

impl ReconnectSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// The delay to wait before the next attempt, or `None` once attempts
    /// are exhausted (terminal until reset).
    pub fn next_delay(&mut self, policy: &ReconnectPolicy) -> Option<Duration> {
        if self.attempts >= policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        let next = match self.current {
            None => policy.initial_delay,
            Some(prev) => (prev * 2).min(policy.max_delay),
        };
        self.current = Some(next);
        Some(next)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(initial_ms: u64, max_ms: u64, attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            max_attempts: attempts,
        }
    }

    #[test]
    fn delay_doubles_and_caps() {
        let p = policy(100, 350, 10);
        let mut s = ReconnectSchedule::new();
        assert_eq!(s.next_delay(&p), Some(Duration::from_millis(100)));
        assert_eq!(s.next_delay(&p), Some(Duration::from_millis(200)));
        assert_eq!(s.next_delay(&p), Some(Duration::from_millis(350)));
        assert_eq!(s.next_delay(&p), Some(Duration::from_millis(350)));
    }

    #[test]
    fn exhausts_after_exactly_max_attempts() {
        let p = policy(10, 100, 3);
        let mut s = ReconnectSchedule::new();
        assert!(s.next_delay(&p).is_some());
        assert!(s.next_delay(&p).is_some());
        assert!(s.next_delay(&p).is_some());
        assert_eq!(s.attempts(), 3);
        assert!(s.next_delay(&p).is_none());
        assert!(s.next_delay(&p).is_none());
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let p = policy(10, 100, 1);
        let mut s = ReconnectSchedule::new();
        assert!(s.next_delay(&p).is_some());
        assert!(s.next_delay(&p).is_none());
        s.reset();
        assert_eq!(s.next_delay(&p), Some(Duration::from_millis(10)));
    }

    #[test]
    fn zero_attempts_is_terminal_immediately() {
        let p = policy(10, 100, 0);
        let mut s = ReconnectSchedule::new();
        assert!(s.next_delay(&p).is_none());
    }
}
