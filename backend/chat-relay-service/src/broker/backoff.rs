/// Linear backoff with jitter for broker reconnects
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Reconnect attempts per failure before giving up
    pub max_attempts: u32,
    /// Attempt `k` waits `k * base_delay`
    pub base_delay: Duration,
    /// Uniform jitter applied in both directions
    pub max_jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_jitter: Duration::from_millis(250),
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt `attempt` (1-based): `attempt * base ± jitter`,
    /// never negative.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.saturating_mul(attempt.max(1));
        let jitter_ms = self.max_jitter.as_millis() as i64;
        if jitter_ms == 0 {
            return base;
        }

        let offset = rand::thread_rng().gen_range(-jitter_ms..=jitter_ms);
        let millis = (base.as_millis() as i64 + offset).max(0);
        Duration::from_millis(millis as u64)
    }
}
