//! Bounded exponential backoff for exchange calls.

use std::future::Future;
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use tracing::warn;

use crate::error::GatewayError;

/// Backoff bounds for one logical call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Give up once this much time has passed since the first attempt
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(8),
            max_elapsed: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Default intervals, giving up after `max_elapsed`.
    pub fn with_max_elapsed(max_elapsed: Duration) -> Self {
        Self {
            max_elapsed,
            ..Self::default()
        }
    }
}

/// Run `op`, retrying transient [`GatewayError`]s until the policy is exhausted.
/// Non-transient errors are returned immediately.
pub async fn with_retry<T, F, Fut>(what: &str, policy: &RetryPolicy, mut op: F) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(policy.initial_interval)
        .with_max_interval(policy.max_interval)
        .with_max_elapsed_time(Some(policy.max_elapsed))
        .build();

    backoff::future::retry(backoff, || {
        let attempt = op();
        async move {
            attempt.await.map_err(|e| {
                if e.is_transient() {
                    warn!(call = what, category = %e.category(), error = %e, "Transient exchange error, retrying");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            max_elapsed: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let attempts = AtomicUsize::new(0);
        let result = with_retry("test", &fast(), || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(GatewayError::Network("reset".into()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(assert_ok!(result), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let attempts = AtomicUsize::new(0);
        let result: Result<(), _> = with_retry("test", &fast(), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(GatewayError::InsufficientBalance("0 USDT".into()))
        })
        .await;

        assert!(matches!(result, Err(GatewayError::InsufficientBalance(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_transient_error() {
        let policy = RetryPolicy {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            ..RetryPolicy::with_max_elapsed(Duration::from_millis(20))
        };
        let result: Result<(), _> = with_retry("test", &policy, || async {
            Err(GatewayError::RateLimited("429".into()))
        })
        .await;

        assert!(matches!(assert_err!(result), GatewayError::RateLimited(_)));
    }
}
