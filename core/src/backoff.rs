//! Reconnect backoff
//!
//! Capped exponential delay for observer reconnects: start at the initial
//! delay, double on every failed attempt, never exceed the cap. A small
//! random jitter spreads reconnect storms when the server restarts.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempt: u32,
    /// Fraction of the delay added as random jitter (0.0 disables)
    jitter: f64,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            attempt: 0,
            jitter: 0.1,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.attempt = self.attempt.saturating_add(1);
        self.current = base.saturating_mul(2).min(self.max);

        if self.jitter <= 0.0 {
            return base;
        }
        let spread = base.as_secs_f64() * self.jitter;
        let extra = rand::thread_rng().gen_range(0.0..=spread);
        (base + Duration::from_secs_f64(extra)).min(self.max)
    }

    /// Back to the initial delay after a successful connect
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempt = 0;
    }

    /// Failed attempts since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}
