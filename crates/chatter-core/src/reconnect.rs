use std::time::Duration;

/// Bounded exponential backoff governing reconnect timing and limit.
///
/// `delay_for_attempt` is monotonically non-decreasing in the attempt number
/// and capped, so back-to-back failures never produce connection storms.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
    max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
            max_attempts,
        }
    }

    /// Attempt cap after which reconnection is abandoned.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether an attempt number (counted from 1) is still within the cap.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }

    /// Backoff delay for an attempt number counted from 1.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let multiplier = 1_u64 << shift;
        let calculated = self.base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(calculated.min(self.max_delay_ms))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(5_000, 30_000, 5)
    }
}
