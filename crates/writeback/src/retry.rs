use std::{future::Future, time::Duration};

use anyhow::anyhow;
use mergegate_core::config::WritebackConfig;
use tokio::time::sleep;

/// Exponential backoff policy for transport errors during write-back. Any
/// error retries until the attempt budget is spent; the last error is then
/// re-raised.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl From<&WritebackConfig> for RetryPolicy {
    fn from(config: &WritebackConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given zero-based attempt, doubling
    /// each time and capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub async fn run<T, F, Fut>(&self, what: &str, mut operation: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut last_error = None;
        for attempt in 0..self.max_retries.max(1) {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let delay = self.delay_for_attempt(attempt);
                    tracing::warn!(
                        "{what} failed (attempt {}/{}): {e:#}",
                        attempt + 1,
                        self.max_retries.max(1),
                    );
                    last_error = Some(e);
                    if attempt + 1 < self.max_retries.max(1) {
                        sleep(delay).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow!("{what} failed with no attempts")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use anyhow::bail;

    use super::*;

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let policy = RetryPolicy::default();
        let attempts = AtomicU32::new(0);
        let result = policy
            .run("create status", || async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    bail!("503 Service Unavailable");
                }
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(result, 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_error_reraised_when_exhausted() {
        let policy = RetryPolicy::default();
        let attempts = AtomicU32::new(0);
        let err = policy
            .run("create status", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow!("connection reset"))
            })
            .await
            .unwrap_err();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(err.to_string().contains("connection reset"));
    }
}
