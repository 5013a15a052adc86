//! Bounded exponential backoff for upstream retries.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt; total attempts = max_retries + 1.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(20);
        let scaled = self
            .initial_delay
            .mul_f64(self.multiplier.powi(exponent as i32));
        scaled.min(self.max_delay)
    }

    /// `base_delay` with ±10% jitter so synchronized workers fan out.
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        let jitter = rand::rng().random_range(-0.1..=0.1);
        base.mul_f64(1.0 + jitter)
    }
}
