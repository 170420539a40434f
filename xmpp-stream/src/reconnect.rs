//! Deciding when to reconnect after an unexpected disconnect.

use std::time::{Duration, Instant};

use crate::error::Error;

/// Delays between reconnection attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// `(attempts, delay)`: while fewer than `attempts` have been made, wait
    /// `delay`. Must be sorted by `attempts`.
    pub schedule: Vec<(u32, Duration)>,
    /// Delay once the schedule is exhausted.
    pub max_delay: Duration,
    /// Delay after the keep-alive detected a dead connection.
    pub keep_alive_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            schedule: vec![
                (5, Duration::from_secs(10)),
                (10, Duration::from_secs(20)),
                (15, Duration::from_secs(40)),
            ],
            max_delay: Duration::from_secs(60),
            keep_alive_delay: Duration::from_secs(1),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the next attempt, given how many attempts were made
    /// since the last successful connection.
    pub fn delay(&self, attempts: u32) -> Duration {
        self.schedule
            .iter()
            .find(|(limit, _)| attempts < *limit)
            .map(|(_, delay)| *delay)
            .unwrap_or(self.max_delay)
    }
}

/// Schedules reconnection attempts.
///
/// Feed it with [`Self::connection_lost`] and [`Self::connected`], and wake
/// it up at [`Self::poll_timeout`]. It never touches the network itself.
#[derive(Debug, Default)]
pub struct ReconnectionSupervisor {
    policy: ReconnectPolicy,
    attempts: u32,
    deadline: Option<Instant>,
}

impl ReconnectionSupervisor {
    /// Create a supervisor with the given policy.
    pub fn new(policy: ReconnectPolicy) -> Self {
        ReconnectionSupervisor {
            policy,
            attempts: 0,
            deadline: None,
        }
    }

    /// Attempts made since the last successful connection.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether an attempt is scheduled.
    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// A connection reached the ready state.
    pub fn connected(&mut self) {
        self.attempts = 0;
        self.deadline = None;
    }

    /// The connection was lost without the application asking for it.
    /// Returns the delay until the next attempt, or `None` when the error
    /// forbids reconnecting.
    pub fn connection_lost(&mut self, error: &Error, now: Instant) -> Option<Duration> {
        if error.is_fatal_for_reconnect() {
            log::info!("Session replaced by another client, not reconnecting");
            self.deadline = None;
            return None;
        }
        let delay = match error {
            Error::KeepAliveTimeout => self.policy.keep_alive_delay,
            _ => self.policy.delay(self.attempts),
        };
        log::debug!(
            "Reconnecting in {:?} (attempt {}) after: {}",
            delay,
            self.attempts + 1,
            error
        );
        self.deadline = Some(now + delay);
        Some(delay)
    }

    /// Forget any scheduled attempt.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// When [`Self::handle_timeout`] must be called.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns true when an attempt must start now.
    pub fn handle_timeout(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                self.attempts += 1;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamErrorCondition;

    #[test]
    fn delay_schedule() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(10));
        assert_eq!(policy.delay(4), Duration::from_secs(10));
        assert_eq!(policy.delay(5), Duration::from_secs(20));
        assert_eq!(policy.delay(14), Duration::from_secs(40));
        assert_eq!(policy.delay(15), Duration::from_secs(60));
        assert_eq!(policy.delay(1000), Duration::from_secs(60));
    }

    #[test]
    fn attempts_grow_until_connected() {
        let now = Instant::now();
        let mut supervisor = ReconnectionSupervisor::default();
        for _ in 0..5 {
            let delay = supervisor
                .connection_lost(&Error::Disconnected, now)
                .unwrap();
            assert_eq!(delay, Duration::from_secs(10));
            assert!(!supervisor.handle_timeout(now));
            assert!(supervisor.handle_timeout(now + delay));
        }
        assert_eq!(
            supervisor.connection_lost(&Error::Disconnected, now),
            Some(Duration::from_secs(20))
        );
        supervisor.connected();
        assert_eq!(supervisor.attempts(), 0);
        assert!(!supervisor.is_pending());
    }

    #[test]
    fn keep_alive_reconnects_quickly() {
        let mut supervisor = ReconnectionSupervisor::default();
        assert_eq!(
            supervisor.connection_lost(&Error::KeepAliveTimeout, Instant::now()),
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn conflict_inhibits_reconnection() {
        let now = Instant::now();
        let mut supervisor = ReconnectionSupervisor::default();
        let error = Error::Stream(StreamErrorCondition::Conflict);
        assert_eq!(supervisor.connection_lost(&error, now), None);
        assert_eq!(supervisor.poll_timeout(), None);
    }

    #[test]
    fn cancel_clears_the_timer() {
        let now = Instant::now();
        let mut supervisor = ReconnectionSupervisor::default();
        supervisor.connection_lost(&Error::Disconnected, now);
        supervisor.cancel();
        assert!(!supervisor.handle_timeout(now + Duration::from_secs(3600)));
    }
}
