//! Reconnect backoff as an explicit state object.
//!
//! Each connection owns one [`Backoff`]. A disconnect asks it for the next
//! delay; `None` means the attempt budget is spent and the connection must
//! move to `failed`. A session that delivers data calls [`Backoff::reset`];
//! a bare handshake does not.
//!
//! ```text
//! attempt:  1    2    3    4   ...   n > max_attempts
//! delay:    1s   2s   4s   8s  ...   None
//!                          (capped at max_delay)
//! ```

use std::time::Duration;

/// Static reconnect parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
    /// Reconnect attempts allowed between two sessions that delivered data.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2,
            max_attempts: 10,
        }
    }
}

/// Mutable backoff state for one connection.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
    next_delay: Duration,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let next_delay = policy.initial_delay.min(policy.max_delay);
        Self { policy, attempt: 0, next_delay }
    }

    /// Delay before the next reconnect attempt, or `None` once
    /// `max_attempts` attempts have been handed out.
    pub fn next(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let delay = self.next_delay;
        self.attempt += 1;
        self.next_delay = delay.saturating_mul(self.policy.multiplier.max(1)).min(self.policy.max_delay);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.next_delay = self.policy.initial_delay.min(self.policy.max_delay);
    }

    /// Attempts handed out since the last reset.
    #[inline]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.policy.max_attempts
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn doubles_until_cap_then_exhausts() {
        let mut b = Backoff::new(ReconnectPolicy {
            initial_delay: secs(1),
            max_delay: secs(5),
            multiplier: 2,
            max_attempts: 5,
        });
        let delays: Vec<_> = std::iter::from_fn(|| b.next()).collect();
        assert_eq!(delays, vec![secs(1), secs(2), secs(4), secs(5), secs(5)]);
        assert!(b.is_exhausted());
        assert_eq!(b.next(), None);
    }

    #[test]
    fn reset_restarts_sequence() {
        let mut b = Backoff::new(ReconnectPolicy { max_attempts: 3, ..Default::default() });
        assert_eq!(b.next(), Some(secs(1)));
        assert_eq!(b.next(), Some(secs(2)));
        b.reset();
        assert_eq!(b.attempt(), 0);
        assert_eq!(b.next(), Some(secs(1)));
    }

    #[test]
    fn zero_attempts_fails_immediately() {
        let mut b = Backoff::new(ReconnectPolicy { max_attempts: 0, ..Default::default() });
        assert_eq!(b.next(), None);
    }

    #[test]
    fn default_policy_matches_documented_values() {
        let p = ReconnectPolicy::default();
        assert_eq!((p.initial_delay, p.max_delay, p.multiplier, p.max_attempts), (secs(1), secs(60), 2, 10));
    }
}
