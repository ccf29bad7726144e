use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

/// Retry budget for transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            max_retries: 5,
        }
    }
}

#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_delay_ms: u64,
    max_delay_ms: u64,
    max_retries: Option<u32>,
    current_attempt: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub struct MaxRetriesExceeded;

impl std::fmt::Display for MaxRetriesExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Maximum retry attempts exceeded")
    }
}

impl std::error::Error for MaxRetriesExceeded {}

impl ExponentialBackoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            initial_delay_ms: policy.initial_delay_ms,
            max_delay_ms: policy.max_delay_ms.max(policy.initial_delay_ms),
            max_retries: Some(policy.max_retries),
            current_attempt: 0,
        }
    }

    /// Backoff that never runs out of attempts
    pub fn unbounded(initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            initial_delay_ms,
            max_delay_ms: max_delay_ms.max(initial_delay_ms),
            max_retries: None,
            current_attempt: 0,
        }
    }

    /// Delay for the current attempt before jitter
    pub fn base_delay(&self) -> Duration {
        let factor = 1u64
            .checked_shl(self.current_attempt)
            .unwrap_or(u64::MAX);
        let delay = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Base delay with up to 50% taken off at random
    fn jittered_delay(&self) -> Duration {
        let base = self.base_delay().as_millis() as u64;
        let jitter = if base > 1 {
            rand::thread_rng().gen_range(0..=base / 2)
        } else {
            0
        };
        Duration::from_millis(base - jitter)
    }

    pub async fn sleep(&mut self) -> Result<(), MaxRetriesExceeded> {
        if let Some(max) = self.max_retries {
            if self.current_attempt >= max {
                return Err(MaxRetriesExceeded);
            }
        }

        let delay = self.jittered_delay();

        match self.max_retries {
            Some(max) => log::warn!(
                "⏳ Retry attempt {} of {} in {}ms",
                self.current_attempt + 1,
                max,
                delay.as_millis()
            ),
            None => log::warn!(
                "⏳ Retry attempt {} in {}ms",
                self.current_attempt + 1,
                delay.as_millis()
            ),
        }

        sleep(delay).await;
        self.current_attempt = self.current_attempt.saturating_add(1);
        Ok(())
    }

    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}
