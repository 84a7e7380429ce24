use rand::Rng;
use std::time::Duration;

/// Bounded exponential backoff with jitter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
            ..Self::default()
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    /// Doubles each time, capped at `max_delay`, with up to 25% jitter.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        let jitter_ms = (delay.as_millis() as u64) / 4;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}
