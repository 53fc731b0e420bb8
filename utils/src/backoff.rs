use std::time::Duration;

use rand::Rng;

/// Exponential backoff bounded on both ends. Used for host build retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub min: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    /// Delay before retry `attempt` (1-based). Doubles from `min`, capped at
    /// `max`, with up to 20% jitter subtracted so concurrent hosts spread out.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let base = self
            .min
            .saturating_mul(1u32 << exp)
            .min(self.max)
            .max(self.min);
        let jitter_range = base.as_millis() as u64 / 5;
        if jitter_range == 0 {
            return base;
        }
        let jitter = rand::rng().random_range(0..=jitter_range);
        base.saturating_sub(Duration::from_millis(jitter)).max(self.min)
    }
}

/// Sleeps for the backoff delay of `attempt`.
pub async fn delay_with_backoff(policy: &BackoffPolicy, attempt: u32) {
    tokio::time::sleep(policy.delay(attempt)).await;
}
