use std::{collections::HashMap, sync::Mutex, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use time::UtcDateTime;

/// Capability for anti-replay nonce storage.
///
/// The in-memory implementation is single-process only; multi-instance
/// deployments must back this with a shared keyed store with TTL so the
/// check-and-store stays atomic across instances.
#[async_trait]
pub trait NonceStore: Send + Sync {
    /// Atomically check whether `nonce` has been seen within its TTL and
    /// store it if not. Returns `true` if the nonce is new, `false` on a
    /// replay. A stored-but-expired nonce counts as new.
    async fn check_and_store(&self, nonce: &str, ttl: Duration) -> Result<bool>;

    /// Drop expired nonces, returning how many were removed.
    async fn cleanup_expired(&self) -> Result<usize>;
}

/// Process-local nonce store backed by a map of expiry times.
#[derive(Default)]
pub struct MemoryNonceStore {
    nonces: Mutex<HashMap<String, UtcDateTime>>,
}

impl MemoryNonceStore {
    pub fn new() -> Self { Self::default() }
}

#[async_trait]
impl NonceStore for MemoryNonceStore {
    async fn check_and_store(&self, nonce: &str, ttl: Duration) -> Result<bool> {
        let now = UtcDateTime::now();
        let mut nonces = self.nonces.lock().unwrap();
        if let Some(expires_at) = nonces.get(nonce) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        nonces.insert(nonce.to_string(), now + ttl);
        Ok(true)
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        let now = UtcDateTime::now();
        let mut nonces = self.nonces.lock().unwrap();
        let before = nonces.len();
        nonces.retain(|_, expires_at| *expires_at > now);
        Ok(before - nonces.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replay_within_window() {
        let store = MemoryNonceStore::new();
        let ttl = Duration::from_secs(300);
        assert!(store.check_and_store("delivery-1", ttl).await.unwrap());
        assert!(!store.check_and_store("delivery-1", ttl).await.unwrap());
        assert!(store.check_and_store("delivery-2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_nonce_is_new() {
        let store = MemoryNonceStore::new();
        let ttl = Duration::from_millis(20);
        assert!(store.check_and_store("delivery-1", ttl).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.check_and_store("delivery-1", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired() {
        let store = MemoryNonceStore::new();
        store.check_and_store("old", Duration::from_millis(10)).await.unwrap();
        store.check_and_store("new", Duration::from_secs(300)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.cleanup_expired().await.unwrap(), 1);
        assert!(!store.check_and_store("new", Duration::from_secs(300)).await.unwrap());
    }
}
