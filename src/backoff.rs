use std::time::Duration;

// =============================================================================
// Exponential Backoff
// =============================================================================

/// Stateful delay generator: `min * 2^attempt`, clamped to `[min, max]`.
///
/// Every call to [`Backoff::next_delay`] moves one step further; the only
/// way back to `min` is a fresh generator.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            attempt: 0,
        }
    }

    /// Delay for the current attempt, then advance.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Delay the next call to `next_delay` will return, without advancing.
    pub fn peek(&self) -> Duration {
        self.delay_for(self.attempt)
    }

    #[allow(dead_code)] // Exercised by tests
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        if self.min >= self.max {
            return self.max;
        }

        // Overflow of the factor or the product means we are past max anyway
        1u32.checked_shl(attempt)
            .and_then(|factor| self.min.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}
