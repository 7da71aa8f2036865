//! Retry spacing for deferred and failed tasks.
//!
//! Delays grow exponentially with the attempt number, are capped at a
//! maximum that is configured strictly below the re-sync interval, and are
//! jittered so tasks that deferred together do not poll together.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first retry (before jitter).
    pub base: Duration,
    /// Upper bound for any delay, jitter included.
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            max: Duration::from_secs(900),
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Un-jittered delay for the given 1-based attempt.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base.as_secs_f64() * f64::from(1u32 << exponent);
        Duration::from_secs_f64(delay.min(self.max.as_secs_f64()))
    }

    /// Jittered delay: uniformly between half the ceiling and the ceiling.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        Duration::from_secs_f64(ceiling.as_secs_f64() * jitter)
    }

    /// `delay` as a chrono offset, for scheduling `next_check_at`.
    pub fn delay_chrono(&self, attempt: u32) -> chrono::Duration {
        chrono::Duration::from_std(self.delay(attempt)).unwrap_or(chrono::Duration::zero())
    }
}
