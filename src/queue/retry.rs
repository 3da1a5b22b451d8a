use std::fmt::Display;
use std::future::Future;

use tokio::time::{sleep, Duration};

use crate::logging::log_delivery_failure;

/// Retry configuration
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// Linear backoff: the wait after failed attempt `n` (1-based) is `n * base`.
    pub(crate) fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_ms.saturating_mul(attempt as u64);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Retry a fallible async operation with linear backoff. Every failed attempt
/// is logged; the last error is returned once attempts run out.
pub async fn retry_async<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                log_delivery_failure(operation_name, attempt, max_attempts, &e);
                if attempt >= max_attempts {
                    return Err(e);
                }
                sleep(config.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_delay_calculation() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 3500,
        };

        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(3000));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(3500)); // clamped
    }

    #[tokio::test]
    async fn test_retry_success_first_try() {
        let config = RetryConfig::default();
        let result: Result<i32, String> = retry_async(&config, "test", |_| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_eventual_success() {
        let config = RetryConfig {
            base_delay_ms: 1,
            ..Default::default()
        };

        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: Result<i32, String> = retry_async(&config, "test", |attempt| {
            let c = counter_clone.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err("not yet".to_string())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_at_cap() {
        let config = RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            ..Default::default()
        };
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let result: Result<(), String> = retry_async(&config, "test", |attempt| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(format!("fail {}", attempt))
            }
        })
        .await;
        assert_eq!(result.unwrap_err(), "fail 3");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
