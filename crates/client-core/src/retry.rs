//! Retry policy shared by the work fetcher, the result submitter and the
//! session manager.
//!
//! One policy object instead of ad-hoc sleeps: exponential backoff with
//! jitter (`0.5·step + 0.5·step·rand`), a hard cap on the step, and an
//! optional bound on total attempts.

use std::time::Duration;

use rand::Rng as _;

/// Backoff/retry parameters.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// First backoff step.
    pub base: Duration,
    /// Largest backoff step.
    pub cap: Duration,
    /// Maximum attempts before giving up; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Policy for work fetching: unbounded retries, capped interval.
    pub const FETCH: RetryPolicy = RetryPolicy {
        base: Duration::from_secs(1),
        cap: Duration::from_secs(30),
        max_attempts: None,
    };

    /// Policy for result submission: bounded attempts, then the lease is
    /// allowed to expire server-side.
    pub const SUBMIT: RetryPolicy = RetryPolicy {
        base: Duration::from_secs(2),
        cap: Duration::from_secs(20),
        max_attempts: Some(6),
    };

    /// Policy for session registration and keepalive.
    pub const SESSION: RetryPolicy = RetryPolicy {
        base: Duration::from_secs(1),
        cap: Duration::from_secs(60),
        max_attempts: None,
    };

    /// Start a fresh backoff sequence under this policy.
    pub fn start(&self) -> Backoff {
        Backoff {
            policy: *self,
            step: self.base,
            attempts: 0,
        }
    }
}

/// Mutable backoff state for one retry sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    step: Duration,
    attempts: u32,
}

impl Backoff {
    /// Next sleep interval, or `None` once the attempt budget is spent.
    ///
    /// The returned interval is jittered into `[step/2, step]` so a fleet of
    /// workers does not hammer the queue in lockstep after an outage.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_attempts {
            if self.attempts >= max {
                return None;
            }
        }
        self.attempts += 1;

        let step = self.step.min(self.policy.cap);
        self.step = (self.step + self.policy.base).min(self.policy.cap);

        let jitter: f64 = rand::rng().random();
        Some(step.mul_f64(0.5 + 0.5 * jitter))
    }

    /// Attempts taken so far in this sequence.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_stay_within_half_to_full_step() {
        let policy = RetryPolicy {
            base: Duration::from_secs(4),
            cap: Duration::from_secs(4),
            max_attempts: None,
        };
        let mut backoff = policy.start();
        for _ in 0..50 {
            let d = backoff.next_delay().unwrap();
            assert!(d >= Duration::from_secs(2), "{d:?} below jitter floor");
            assert!(d <= Duration::from_secs(4), "{d:?} above step");
        }
    }

    #[test]
    fn step_grows_linearly_up_to_cap() {
        let policy = RetryPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(3),
            max_attempts: None,
        };
        let mut backoff = policy.start();
        let mut maxima = Vec::new();
        for _ in 0..6 {
            // The jitter ceiling equals the current step.
            let step = backoff.step.min(policy.cap);
            maxima.push(step);
            backoff.next_delay().unwrap();
        }
        assert_eq!(
            maxima,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
                Duration::from_secs(3),
                Duration::from_secs(3),
                Duration::from_secs(3),
            ]
        );
    }

    #[test]
    fn attempt_budget_is_enforced() {
        let policy = RetryPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(1),
            max_attempts: Some(3),
        };
        let mut backoff = policy.start();
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempts(), 3);
    }
}
