//! Shared retry/backoff policy
//!
//! One policy object injected into the message bus, the agent runner and
//! action execution, instead of re-implementing backoff per call site.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first call
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Symmetric jitter fraction, e.g. 0.2 for plus or minus 20%
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Policy used by the agent runner: 3 attempts total, same curve.
    pub fn agent() -> Self {
        Self {
            max_attempts: 3,
            ..Self::default()
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based; attempt 0 is the first
    /// call and has no delay). Jitter comes from the injected rng so tests
    /// stay deterministic.
    pub fn delay_for_attempt(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = self.base_delay.as_millis() as f64 * self.factor.powi(attempt as i32 - 1);
        let capped = exp.min(self.max_delay.as_millis() as f64);
        let jittered = if self.jitter > 0.0 {
            let spread = rng.gen_range(-self.jitter..=self.jitter);
            (capped * (1.0 + spread)).max(0.0)
        } else {
            capped
        };
        Duration::from_millis(jittered as u64)
    }

    /// Whether another attempt is allowed after `attempt` attempts were made.
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}
