//! Bounded exponential backoff for transient backend failures.

use std::future::Future;
use std::time::Duration;

use conduit::config::RetryConfig;
use conduit::Result;
use rand::Rng;
use tracing::warn;

/// Runs `op` until it succeeds, fails with a non-transient error, or
/// `max_attempts` is exhausted. Only timeouts and 5xx responses are retried.
pub async fn with_retry<T, F, Fut>(retry: &RetryConfig, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = jittered(retry.delay_for(attempt));
                warn!(
                    operation = %label,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Adds up to 25% random jitter.
fn jittered(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 4;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit::ConnectorError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 5,
        }
    }

    #[tokio::test]
    async fn test_transient_error_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_retry(3), "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ConnectorError::ConnectionTimeout { timeout_ms: 10 })
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast_retry(3), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ConnectorError::QueryFailed {
                message: "upstream".into(),
                status: Some(503),
            })
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_client_errors_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast_retry(5), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ConnectorError::QueryFailed {
                message: "bad request".into(),
                status: Some(400),
            })
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let base = Duration::from_millis(400);
        for _ in 0..100 {
            let d = jittered(base);
            assert!(d >= base && d <= Duration::from_millis(500));
        }
    }
}
