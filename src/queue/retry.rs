use std::time::Duration;

use rand::Rng;

/// Exponential backoff schedule for failed jobs.
///
/// The delay before attempt `n + 1` (after `n` failures) is
/// `base * 2^(n-1)`, optionally stretched by an additive jitter of at
/// most `jitter * delay` (jitter is capped at 10%).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn new(base: Duration, jitter: f64) -> Self {
        Self {
            base,
            jitter: jitter.clamp(0.0, 0.1),
        }
    }

    /// Delay to wait after `attempts` failed attempts (1-indexed).
    pub fn next_delay(&self, attempts: u32) -> Duration {
        // Cap the exponent so the shift cannot overflow.
        let exponent = attempts.saturating_sub(1).min(20);
        let base_ms = self.base.as_millis() as u64;
        let mut delay_ms = base_ms.saturating_mul(1 << exponent);
        if self.jitter > 0.0 {
            let extra = (delay_ms as f64 * rand::thread_rng().gen_range(0.0..self.jitter)) as u64;
            delay_ms = delay_ms.saturating_add(extra);
        }
        Duration::from_millis(delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            jitter: 0.0,
        }
    }
}
