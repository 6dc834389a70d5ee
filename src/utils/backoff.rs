//! Bounded exponential backoff for retrying transient I/O errors.
//!
//! The same shape is used by the read loop, the write path and the server's accept
//! loop: each failure doubles the delay up to `max_delay`, and after `max_retries`
//! failures without an intervening success the caller gives up.

use std::time::Duration;

use crate::config::RetryConfig;

/// Exponential backoff with a retry budget
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    current: Duration,
    max: Duration,
    max_retries: u32,
    attempts: u32,
    /// Jitter factor (0.0 to 1.0)
    jitter: f64,
}

impl Backoff {
    /// Create a new backoff from configuration
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.base_delay, config.max_delay, config.max_retries, config.jitter)
    }

    /// Create a new backoff with custom parameters
    pub fn new(base: Duration, max: Duration, max_retries: u32, jitter: f64) -> Self {
        Self {
            base,
            current: base,
            max,
            max_retries,
            attempts: 0,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay to wait before the next retry, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_retries {
            return None;
        }
        self.attempts += 1;

        let delay = self.current;
        self.current = std::cmp::min(self.current.saturating_mul(2), self.max);

        if self.jitter > 0.0 {
            let jitter_amount = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
            Some(delay + Duration::from_secs_f64(jitter_amount))
        } else {
            Some(delay)
        }
    }

    /// Forget previous failures after a successful operation
    pub fn reset(&mut self) {
        self.current = self.base;
        self.attempts = 0;
    }

    /// Retries consumed since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let mut backoff =
            Backoff::new(Duration::from_secs(1), Duration::from_secs(5), 10, 0.0);

        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(4)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(5)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_backoff_budget_is_bounded() {
        let mut backoff =
            Backoff::new(Duration::from_millis(10), Duration::from_millis(100), 3, 0.0);

        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.attempts(), 3);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_jitter_stays_within_factor() {
        let mut backoff =
            Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 1, 0.5);
        let delay = backoff.next_delay().unwrap();
        assert!(delay >= Duration::from_millis(100));
        assert!(delay <= Duration::from_millis(150));
    }
}
