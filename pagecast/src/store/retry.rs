//! Retry helpers for store operations.

use std::future::Future;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::domain::RetryPolicy;
use crate::{Error, Result};

/// Run `op`, retrying transient failures according to `policy`.
///
/// Non-transient errors are returned as-is. Once the retry budget is spent the
/// last transient error is surfaced as [`Error::StoreUnavailable`].
pub async fn retry_transient<T, F, Fut>(
    op_name: &'static str,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) => {
                if !policy.should_retry(attempt) {
                    warn!(
                        operation = op_name,
                        attempts = attempt + 1,
                        error = %err,
                        "Store operation failed, giving up"
                    );
                    return Err(Error::StoreUnavailable {
                        operation: op_name,
                        attempts: attempt + 1,
                        message: err.to_string(),
                    });
                }

                let delay = policy.delay_for_attempt(attempt);
                debug!(
                    "Transient store error during {}, retrying in {:?} (attempt {}/{}): {}",
                    op_name,
                    delay,
                    attempt + 1,
                    policy.max_retries,
                    err
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let value = retry_transient("get", &RetryPolicy::default(), || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::StoreConnection("reset".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_surfaces_store_unavailable() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = retry_transient("set", &RetryPolicy::default(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::StoreConnection("down".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            Error::StoreUnavailable {
                operation: "set",
                attempts: 5,
                ..
            }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_domain_errors_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = retry_transient("get", &RetryPolicy::default(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::not_found("task", "x"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
