//! Async retry utilities with exponential backoff

use std::time::Duration;

/// Retry an async operation with exponential backoff and a delay ceiling.
///
/// Attempts the operation up to `max_attempts` times; between attempts the
/// delay doubles from `base_delay_ms` up to `max_delay_ms`. Only errors for
/// which `should_retry` returns true are retried.
pub async fn retry_with_backoff<F, Fut, T, E>(
    max_attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    should_retry: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempts >= max_attempts || !should_retry(&e) {
                    return Err(e);
                }
                let delay_ms =
                    (base_delay_ms.saturating_mul(2_u64.pow(attempts - 1))).min(max_delay_ms);
                let delay = Duration::from_millis(delay_ms);
                tracing::warn!(
                    error = %e,
                    attempt = attempts,
                    delay_ms = delay.as_millis(),
                    "Retrying after transient error"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[tokio::test]
    async fn test_success_on_first_try() {
        let result =
            retry_with_backoff(3, 1, 10, |_: &&str| true, || async { Ok::<u32, &str>(7) }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn test_success_after_retry() {
        let attempts = RefCell::new(0);
        let result = retry_with_backoff(3, 1, 10, |_: &&str| true, || {
            *attempts.borrow_mut() += 1;
            let n = *attempts.borrow();
            async move {
                if n < 2 {
                    Err("transient error")
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
    }

    #[tokio::test]
    async fn test_failure_after_max_retries() {
        let attempts = RefCell::new(0);
        let result: Result<(), &str> = retry_with_backoff(3, 1, 10, |_: &&str| true, || {
            *attempts.borrow_mut() += 1;
            async { Err("persistent error") }
        })
        .await;
        assert_eq!(result, Err("persistent error"));
        assert_eq!(*attempts.borrow(), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_fast() {
        let attempts = RefCell::new(0);
        let result: Result<(), &str> = retry_with_backoff(3, 1, 10, |_: &&str| false, || {
            *attempts.borrow_mut() += 1;
            async { Err("permanent error") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(*attempts.borrow(), 1);
    }
}
