use std::fmt::Display;
use std::time::Duration;
use tracing::warn;

use crate::config::RetryConfig;

/// Errors that know whether trying again can help.
pub trait Retriable {
    fn is_retriable(&self) -> bool;
}

/// Bounded exponential backoff: `base_delay * 2^(attempt-1)`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

#[derive(Debug)]
pub struct RetryError<E> {
    pub attempts: u32,
    pub last: E,
}

impl<E: Display> Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed after {} attempt(s): {}", self.attempts, self.last)
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.last)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay slept after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails with a non-retriable error, or the
    /// attempt budget is spent. `op` receives the 1-based attempt number.
    pub fn run<T, E, F>(&self, what: &str, mut op: F) -> Result<T, RetryError<E>>
    where
        E: Retriable + Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retriable() && attempt < max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "{what} hit a transient error, backing off"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(RetryError {
                        attempts: attempt,
                        last: e,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Debug)]
    enum FakeError {
        Busy,
        Broken,
    }

    impl Display for FakeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Retriable for FakeError {
        fn is_retriable(&self) -> bool {
            matches!(self, FakeError::Busy)
        }
    }

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn delays_double_from_base() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(1), Duration::from_secs(1));
        assert_eq!(p.delay_for(2), Duration::from_secs(2));
        assert_eq!(p.delay_for(3), Duration::from_secs(4));
        assert_eq!(p.delay_for(4), Duration::from_secs(8));
    }

    #[test]
    fn delay_is_capped() {
        let p = fast(10);
        assert_eq!(p.delay_for(3), Duration::from_millis(4));
        assert_eq!(p.delay_for(40), Duration::from_millis(4));
    }

    #[test]
    fn transient_errors_are_retried_until_success() {
        let calls = Cell::new(0);
        let result = fast(5).run("op", |_| {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(FakeError::Busy)
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn attempts_are_bounded() {
        let err = fast(4).run("op", |_| Err::<(), _>(FakeError::Busy)).unwrap_err();
        assert_eq!(err.attempts, 4);
        assert!(matches!(err.last, FakeError::Busy));
    }

    #[test]
    fn fatal_errors_are_not_retried() {
        let calls = Cell::new(0);
        let err = fast(5)
            .run("op", |_| {
                calls.set(calls.get() + 1);
                Err::<(), _>(FakeError::Broken)
            })
            .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.get(), 1);
    }
}
