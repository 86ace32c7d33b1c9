use std::time::Duration;

use log::{info, warn};

use super::client::FetchError;

/// Bounded retry with linear backoff.
///
/// After failed attempt `n` the caller waits `base_delay * n` before attempt
/// `n + 1`. Once `max_attempts` attempts have failed, the operation gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Wait before the attempt following failed attempt `attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }

    /// Runs `operation` until it succeeds or the attempts are exhausted.
    ///
    /// `operation` receives the attempt number, starting at 1. `sleep` is called
    /// between attempts, never after the last one. Returns `None` when every
    /// attempt failed.
    pub fn run<T, F, S>(&self, label: &str, mut operation: F, sleep: S) -> Option<T>
    where
        F: FnMut(u32) -> Result<T, FetchError>,
        S: Fn(Duration),
    {
        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                info!("  -> Retry {}/{} for {}", attempt, self.max_attempts, label);
            }

            match operation(attempt) {
                Ok(value) => return Some(value),
                Err(error) => {
                    warn!(
                        "{} while fetching {} (attempt {}/{}): {}",
                        error.kind(),
                        label,
                        attempt,
                        self.max_attempts,
                        error
                    );

                    if attempt < self.max_attempts {
                        let delay = self.delay_after(attempt);
                        info!("  -> Waiting {}s before retrying...", delay.as_secs());
                        sleep(delay);
                    }
                }
            }
        }

        warn!(
            "Could not fetch {} after {} attempts",
            label, self.max_attempts
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    #[test]
    fn backoff_is_linear() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_after(1), Duration::from_secs(5));
        assert_eq!(policy.delay_after(2), Duration::from_secs(10));
        assert_eq!(policy.delay_after(3), Duration::from_secs(15));
    }

    #[test]
    fn exhaustion_sleeps_the_sum_of_linear_delays() {
        let policy = RetryPolicy::new(4, Duration::from_secs(5));
        let slept = RefCell::new(Vec::new());
        let mut calls = 0;

        let result: Option<()> = policy.run(
            "03/2025",
            |_| {
                calls += 1;
                Err(FetchError::Timeout("read timed out".to_string()))
            },
            |delay| slept.borrow_mut().push(delay),
        );

        assert!(result.is_none());
        assert_eq!(calls, 4);
        assert_eq!(
            slept.borrow().iter().sum::<Duration>(),
            Duration::from_secs(5 * (1 + 2 + 3))
        );
    }

    #[test]
    fn success_after_a_failure_stops_retrying() {
        let policy = RetryPolicy::default();
        let slept = RefCell::new(Vec::new());

        let result = policy.run(
            "01/2026",
            |attempt| {
                if attempt == 1 {
                    Err(FetchError::ConnectionInterrupted("reset".to_string()))
                } else {
                    Ok(attempt)
                }
            },
            |delay| slept.borrow_mut().push(delay),
        );

        assert_eq!(result, Some(2));
        assert_eq!(*slept.borrow(), vec![Duration::from_secs(5)]);
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let policy = RetryPolicy::new(0, Duration::ZERO);
        assert_eq!(policy.max_attempts, 1);
    }
}
