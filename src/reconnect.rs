//! Exponential backoff reconnect policy.
//!
//! `delay(attempts) = base_delay * 2^attempts`, uncapped delay, capped attempt
//! count. The counter lives on one policy instance owned by its manager, so
//! independent connections never share reconnect state.

use std::time::Duration;

/// Outcome of asking the policy for the next reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Schedule a reconnect after `delay`. `attempt` is the zero-based
    /// counter value the delay was derived from; the counter has already
    /// been incremented when this is returned.
    Retry { attempt: u32, delay: Duration },
    /// Attempt budget spent; the caller must go terminal.
    Exhausted,
}

#[derive(Debug)]
pub struct ReconnectPolicy {
    base_delay_ms: u64,
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay_ms: base_delay.as_millis() as u64,
            max_attempts,
            attempts: 0,
        }
    }

    /// Decide the next reconnection. Increments the attempt counter at
    /// scheduling time, not when the delay elapses.
    pub fn next(&mut self) -> ReconnectDecision {
        if self.attempts >= self.max_attempts {
            return ReconnectDecision::Exhausted;
        }

        let attempt = self.attempts;
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        self.attempts += 1;

        ReconnectDecision::Retry {
            attempt,
            delay: Duration::from_millis(delay_ms),
        }
    }

    /// Reset on successful open.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delays(policy: &mut ReconnectPolicy) -> Vec<u64> {
        let mut out = Vec::new();
        while let ReconnectDecision::Retry { delay, .. } = policy.next() {
            out.push(delay.as_millis() as u64);
        }
        out
    }

    #[test]
    fn doubles_until_exhausted() {
        let mut policy = ReconnectPolicy::new(Duration::from_millis(1_000), 5);
        assert_eq!(delays(&mut policy), vec![1_000, 2_000, 4_000, 8_000, 16_000]);
        assert_eq!(policy.next(), ReconnectDecision::Exhausted);
        // Still exhausted on repeated asks.
        assert_eq!(policy.next(), ReconnectDecision::Exhausted);
    }

    #[test]
    fn counter_increments_at_scheduling_time() {
        let mut policy = ReconnectPolicy::new(Duration::from_millis(1_000), 5);
        assert_eq!(policy.attempts(), 0);
        let decision = policy.next();
        assert_eq!(
            decision,
            ReconnectDecision::Retry {
                attempt: 0,
                delay: Duration::from_millis(1_000)
            }
        );
        assert_eq!(policy.attempts(), 1);
    }

    #[test]
    fn reset_restarts_from_base_delay() {
        let mut policy = ReconnectPolicy::new(Duration::from_millis(1_000), 5);
        policy.next();
        policy.next();
        policy.reset();
        assert_eq!(policy.attempts(), 0);
        assert_eq!(
            policy.next(),
            ReconnectDecision::Retry {
                attempt: 0,
                delay: Duration::from_millis(1_000)
            }
        );
    }

    #[test]
    fn zero_attempt_budget_is_immediately_exhausted() {
        let mut policy = ReconnectPolicy::new(Duration::from_millis(500), 0);
        assert_eq!(policy.next(), ReconnectDecision::Exhausted);
    }

    #[test]
    fn large_attempt_counts_saturate_instead_of_overflowing() {
        let mut policy = ReconnectPolicy::new(Duration::from_millis(1_000), 80);
        let all = delays(&mut policy);
        assert_eq!(all.len(), 80);
        assert!(all.windows(2).all(|w| w[1] >= w[0]));
    }
}
