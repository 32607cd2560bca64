//! Bounded retry for store writes.

use std::future::Future;
use std::time::Duration;

use log::warn;

use crate::error::Result;

/// Backoff schedule for transient write failures.
const BACKOFF: [Duration; 3] = [
    Duration::from_millis(250),
    Duration::from_millis(500),
    Duration::from_millis(1000),
];

/// Runs a store write, retrying transient failures up to three times with
/// 250/500/1000 ms backoff.
///
/// Uniqueness violations and missing rows are returned immediately; they are
/// semantic outcomes, not transients.
///
/// # Errors
///
/// Returns the final error once the schedule is exhausted.
pub async fn write_with_retry<T, F, Fut>(what: &str, op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for (attempt, delay) in BACKOFF.iter().enumerate() {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable_write() => {
                warn!("{what} failed (attempt {}): {e}", attempt + 1);
                tokio::time::sleep(*delay).await;
            }
            Err(e) => return Err(e),
        }
    }
    match op().await {
        Ok(value) => Ok(value),
        Err(e) => {
            warn!("{what} failed after retries: {e}");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::error::StoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn succeeds_without_retry() {
        let calls = AtomicU32::new(0);
        let result = write_with_retry("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(42) }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = write_with_retry("op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StoreError::Fatal("disk hiccup".to_string()))
                } else {
                    Ok("done")
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_schedule() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = write_with_retry("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Fatal("disk gone".to_string())) }
        })
        .await;
        assert!(result.is_err());
        // Three scheduled retries plus the final attempt.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_surface_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = write_with_retry("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::NotFound("row".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
