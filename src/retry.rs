//! Bounded retry with a fixed delay.

use std::time::Duration;

/// Retry an operation up to `max_attempts` times, sleeping `delay` between
/// attempts. The delay does not grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

/// Outcome of a retried operation.
#[derive(Debug)]
pub struct Retried<T, E> {
    /// Last result: the first success, or the final error.
    pub result: Result<T, E>,
    /// Number of attempts made (at least 1).
    pub attempts: u32,
}

impl RetryPolicy {
    /// Create a policy. A `max_attempts` of zero is treated as one.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Maximum number of attempts.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay between attempts.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `op` until it succeeds or the attempts are exhausted.
    ///
    /// `op` receives the 1-based attempt number.
    pub fn run<T, E, F>(&self, mut op: F) -> Retried<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
    {
        let mut attempt = 1;
        loop {
            let result = op(attempt);
            if result.is_ok() || attempt >= self.max_attempts {
                return Retried {
                    result,
                    attempts: attempt,
                };
            }

            tracing::debug!(attempt, delay = ?self.delay, "attempt failed, retrying");
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            attempt += 1;
        }
    }
}
