//! Reconciliation retrier.
//!
//! Re-runs an attempt with exponential backoff while it fails with a
//! retryable error. The backoff is a `tokio::time::sleep`: no lock is held
//! and no thread is blocked between attempts.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RetrySettings;
use crate::error::{ServiceError, ServiceResult};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_backoff.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_backoff
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconciliationRetrier {
    policy: RetryPolicy,
}

impl ReconciliationRetrier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `attempt` until it succeeds, fails with a non-retryable error,
    /// or `max_attempts` is reached. Returns the last error in the latter cases.
    pub async fn retry<T, F, Fut>(&self, operation: &str, mut attempt: F) -> ServiceResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ServiceResult<T>>,
    {
        let mut current = 1;
        loop {
            match attempt(current).await {
                Ok(value) => {
                    if current > 1 {
                        info!(operation, attempt = current, "Reconciliation succeeded");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && current < self.policy.max_attempts => {
                    let delay = self.policy.backoff(current);
                    debug!(
                        operation,
                        attempt = current,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Reconciliation attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    current += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Runs [`retry`](Self::retry) in the background.
    ///
    /// The outcome is only logged: nothing is reported to whoever scheduled it.
    pub fn spawn<F, Fut>(&self, operation: String, attempt: F) -> JoinHandle<()>
    where
        F: FnMut(u32) -> Fut + Send + 'static,
        Fut: Future<Output = ServiceResult<()>> + Send + 'static,
    {
        let retrier = self.clone();
        tokio::spawn(async move {
            match retrier.retry(&operation, attempt).await {
                Ok(()) => debug!(operation = %operation, "Reconciliation complete"),
                Err(ServiceError::UnresolvedPermissions {
                    role_id,
                    permissions,
                }) => warn!(
                    operation = %operation,
                    role_id = %role_id,
                    attempts = retrier.policy.max_attempts,
                    unresolved = ?permissions,
                    "Reconciliation gave up with unresolved permissions"
                ),
                Err(err) => warn!(
                    operation = %operation,
                    attempts = retrier.policy.max_attempts,
                    error = %err,
                    "Reconciliation gave up"
                ),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use uuid::Uuid;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(300),
        }
    }

    fn unresolved() -> ServiceError {
        ServiceError::UnresolvedPermissions {
            role_id: Uuid::nil(),
            permissions: vec!["foo.item.get".to_string()],
        }
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let policy = policy(5);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
        assert_eq!(policy.backoff(30), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let retrier = ReconciliationRetrier::new(policy(5));
        let attempts = AtomicU32::new(0);

        let value = retrier
            .retry("resolve", |n| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(unresolved())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_after_max_attempts() {
        let retrier = ReconciliationRetrier::new(policy(4));
        let attempts = AtomicU32::new(0);

        let err = retrier
            .retry("resolve", |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(unresolved()) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::UnresolvedPermissions { .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_is_not_retried() {
        let retrier = ReconciliationRetrier::new(policy(4));
        let attempts = AtomicU32::new(0);

        let err = retrier
            .retry("resolve", |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ServiceError::not_found("role", "r1")) }
            })
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_retrier_swallows_exhaustion() {
        let retrier = ReconciliationRetrier::new(policy(3));
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let handle = retrier.spawn("resolve role".to_string(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(unresolved()) }
        });

        assert!(handle.await.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
