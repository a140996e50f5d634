//! Reconnect backoff.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter for the reconnect loop.
///
/// Delays start at the base, double per attempt up to the cap, and each
/// draw is spread by the jitter fraction so a fleet of replicas does not
/// reconnect in lockstep.
#[derive(Debug)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max,
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    /// Backoff for the replication client: 200 ms doubling to 10 s, ±20 %.
    pub fn for_reconnect() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(10), 0.2)
    }

    pub fn next_backoff(&mut self) -> Duration {
        let exp = self.base.saturating_mul(2u32.saturating_pow(self.attempt));
        self.attempt = self.attempt.saturating_add(1);
        let capped = exp.min(self.max);
        if self.jitter == 0.0 {
            return capped;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        capped.mul_f64(factor)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
