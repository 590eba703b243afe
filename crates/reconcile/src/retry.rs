//! Bounded retries with exponential backoff for network calls.

use exn::Exn;
use std::future::Future;
use std::time::Duration;

/// Error kinds that can tell whether trying again might help.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for mediabackups_storage::error::ErrorKind {
    fn is_retryable(&self) -> bool {
        mediabackups_storage::error::ErrorKind::is_retryable(self)
    }
}

impl Retryable for mediabackups_metadata::error::ErrorKind {
    fn is_retryable(&self) -> bool {
        mediabackups_metadata::error::ErrorKind::is_retryable(self)
    }
}

impl Retryable for crate::feed::error::ErrorKind {
    fn is_retryable(&self) -> bool {
        crate::feed::error::ErrorKind::is_retryable(self)
    }
}

/// How often, and how patiently, a failing call is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Never less than one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Retry up to `max_attempts` times without waiting in between.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Delay before the attempt following the `attempt`-th failure (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay = self.initial_backoff.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        Duration::try_from_secs_f64(delay).unwrap_or(self.max_backoff).min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is exhausted. The last error is returned as-is.
    pub async fn run<T, K, F, Fut>(&self, what: &str, mut op: F) -> Result<T, Exn<K>>
    where
        K: Retryable + std::error::Error + Send + Sync + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Exn<K>>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts.max(1) => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(operation = what, attempt, error = %err, delay = ?delay, "Retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediabackups_storage::error::ErrorKind as StorageErrorKind;
    use rstest::rstest;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[rstest]
    #[case(1, Duration::from_secs(1))]
    #[case(2, Duration::from_secs(2))]
    #[case(4, Duration::from_secs(8))]
    #[case(6, Duration::from_secs(30))]
    #[case(60, Duration::from_secs(30))]
    fn test_backoff_is_capped(#[case] attempt: u32, #[case] expected: Duration) {
        assert_eq!(RetryPolicy::default().backoff(attempt), expected);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = &AtomicU32::new(0);
        let result = RetryPolicy::immediate(3)
            .run("flaky", move || async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err(Exn::from(StorageErrorKind::Network("reset".into()))),
                    _ => Ok("done"),
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_budget_is_bounded() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::immediate(4)
            .run("down", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Exn::from(StorageErrorKind::Network("refused".into())))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::immediate(4)
            .run("missing", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Exn::from(StorageErrorKind::NotFound(PathBuf::from("a/ab/X.png"))))
            })
            .await;
        assert!(matches!(&*result.unwrap_err(), StorageErrorKind::NotFound(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
