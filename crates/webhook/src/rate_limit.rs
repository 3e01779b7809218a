use std::{collections::HashMap, sync::Mutex, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use time::UtcDateTime;

/// Capability for request rate limiting, keyed by installation or provider
/// scope. Like the nonce store, the in-memory implementation is
/// single-process only.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count a request against `key`. Returns `(allowed, remaining)` for the
    /// current window.
    async fn check(&self, key: &str, limit: u32, window: Duration) -> Result<(bool, u32)>;
}

struct Window {
    started_at: UtcDateTime,
    count: u32,
}

/// Fixed-window rate limiter backed by a per-key counter.
#[derive(Default)]
pub struct MemoryRateLimiter {
    windows: Mutex<HashMap<String, Window>>,
}

impl MemoryRateLimiter {
    pub fn new() -> Self { Self::default() }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn check(&self, key: &str, limit: u32, window: Duration) -> Result<(bool, u32)> {
        let now = UtcDateTime::now();
        let mut windows = self.windows.lock().unwrap();
        let slot = windows
            .entry(key.to_string())
            .or_insert_with(|| Window { started_at: now, count: 0 });
        if now - slot.started_at >= window {
            slot.started_at = now;
            slot.count = 0;
        }
        if slot.count >= limit {
            return Ok((false, 0));
        }
        slot.count += 1;
        Ok((true, limit - slot.count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_limit_enforced_per_key() {
        let limiter = MemoryRateLimiter::new();
        let window = Duration::from_secs(60);
        assert_eq!(limiter.check("a", 2, window).await.unwrap(), (true, 1));
        assert_eq!(limiter.check("a", 2, window).await.unwrap(), (true, 0));
        assert_eq!(limiter.check("a", 2, window).await.unwrap(), (false, 0));
        // Other keys are unaffected
        assert_eq!(limiter.check("b", 2, window).await.unwrap(), (true, 1));
    }

    #[tokio::test]
    async fn test_window_resets() {
        let limiter = MemoryRateLimiter::new();
        let window = Duration::from_millis(20);
        assert!(limiter.check("a", 1, window).await.unwrap().0);
        assert!(!limiter.check("a", 1, window).await.unwrap().0);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(limiter.check("a", 1, window).await.unwrap().0);
    }
}
