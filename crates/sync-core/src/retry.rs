//! Bounded exponential backoff for remote calls.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::remote::RemoteError;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Upper bound for a single remote call
    pub request_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_attempts: 5,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Tiny delays, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_factor: 2.0,
            max_attempts,
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Calculates the delay after `attempt` failures using exponential backoff.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// A remote call that ran out of attempts.
#[derive(Debug, Clone)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last_error: RemoteError,
}

/// Run `op` until it succeeds, fails permanently, or the attempt ceiling is
/// reached. Each attempt is bounded by `request_timeout`.
pub async fn with_retry<T, F, Fut>(
    operation: &str,
    config: &RetryConfig,
    mut op: F,
) -> Result<T, RetryExhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let result = match tokio::time::timeout(config.request_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(config.request_timeout)),
        };

        match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Remote call succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = calculate_backoff(attempt, config);
                warn!(operation, attempt, ?delay, "Remote call failed, retrying: {}", err);
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                return Err(RetryExhausted {
                    attempts: attempt,
                    last_error: err,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            max_attempts: 10,
            request_timeout: Duration::from_secs(1),
        };
        assert_eq!(calculate_backoff(1, &config), Duration::from_secs(1));
        assert_eq!(calculate_backoff(2, &config), Duration::from_secs(2));
        assert_eq!(calculate_backoff(3, &config), Duration::from_secs(4));
        assert_eq!(calculate_backoff(4, &config), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = with_retry("test", &RetryConfig::immediate(5), move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(RemoteError::Transfer("flaky".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_at_ceiling() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = with_retry("test", &RetryConfig::immediate(3), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RemoteError::Transfer("down".into()))
        })
        .await;
        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = with_retry("test", &RetryConfig::immediate(5), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RemoteError::NotFound("x".into()))
        })
        .await;
        assert!(matches!(result.unwrap_err().last_error, RemoteError::NotFound(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_call_times_out() {
        let mut config = RetryConfig::immediate(2);
        config.request_timeout = Duration::from_secs(10);
        let result: Result<(), _> = with_retry("test", &config, || async {
            std::future::pending::<Result<(), RemoteError>>().await
        })
        .await;
        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 2);
        assert!(matches!(exhausted.last_error, RemoteError::Timeout(_)));
    }
}
