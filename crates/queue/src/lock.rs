//! Distributed lock over a [`CacheStore`].
//!
//! Each key is taken with `SET NX PX` and an owner token; release deletes a
//! key only while it still holds that token. A holder that dies keeps the
//! lock until the TTL expires.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use blockfeed_common::IdGenerator;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::cache::{CacheError, CacheStore};

/// Keys held by one acquisition.
#[derive(Debug)]
pub struct Lease {
    keys: Vec<String>,
    token: String,
}

impl Lease {
    #[must_use]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

/// Multi-key mutual exclusion with expiry.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn CacheStore>,
    ids: IdGenerator,
}

fn lock_key(key: &str) -> String {
    format!("lock:{key}")
}

impl DistributedLock {
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            ids: IdGenerator::new(),
        }
    }

    /// Take every key or none of them.
    pub async fn acquire(
        &self,
        keys: &[String],
        ttl: Duration,
    ) -> Result<Option<Lease>, CacheError> {
        let token = self.ids.generate_token();

        // Sorted so overlapping key sets contend in the same order.
        let mut sorted = keys.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut held = Vec::with_capacity(sorted.len());
        for key in sorted {
            match self.store.set_nx_px(&lock_key(&key), &token, ttl).await {
                Ok(true) => held.push(key),
                Ok(false) => {
                    debug!(key = %key, "Lock busy");
                    self.release_keys(&held, &token).await;
                    return Ok(None);
                }
                Err(e) => {
                    self.release_keys(&held, &token).await;
                    return Err(e);
                }
            }
        }

        Ok(Some(Lease { keys: held, token }))
    }

    /// Release a lease. Keys taken over by another owner after expiry are left alone.
    pub async fn release(&self, lease: Lease) {
        self.release_keys(&lease.keys, &lease.token).await;
    }

    async fn release_keys(&self, keys: &[String], token: &str) {
        for key in keys {
            if let Err(e) = self.store.del_if_eq(&lock_key(key), token).await {
                warn!(key = %key, error = %e, "Failed to release lock; it will expire");
            }
        }
    }

    /// Run `body` under the lock. Returns `None` without running it when the
    /// lock is held elsewhere. The lease is released on every exit path,
    /// including a panic in `body`, which is then resumed.
    pub async fn with_lock<F, Fut, T>(
        &self,
        keys: &[String],
        ttl: Duration,
        body: F,
    ) -> Result<Option<T>, CacheError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = T> + Send,
        T: Send,
    {
        let Some(lease) = self.acquire(keys, ttl).await? else {
            return Ok(None);
        };

        let result = AssertUnwindSafe(body()).catch_unwind().await;
        self.release(lease).await;

        match result {
            Ok(output) => Ok(Some(output)),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn test_all_or_nothing() {
        let store = Arc::new(MemoryCache::new());
        let lock = DistributedLock::new(store.clone());
        let ttl = Duration::from_secs(30);

        let first = lock.acquire(&keys(&["b"]), ttl).await.unwrap().unwrap();
        assert!(lock.acquire(&keys(&["a", "b"]), ttl).await.unwrap().is_none());

        // "a" must not stay held after the failed multi-key attempt.
        let a = lock.acquire(&keys(&["a"]), ttl).await.unwrap();
        assert!(a.is_some());

        lock.release(first).await;
        lock.release(a.unwrap()).await;
        assert!(lock.acquire(&keys(&["a", "b"]), ttl).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lock_can_be_taken() {
        let store = Arc::new(MemoryCache::new());
        let lock = DistributedLock::new(store);

        let stale = lock
            .acquire(&keys(&["job"]), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        let fresh = lock
            .acquire(&keys(&["job"]), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(fresh.is_some());

        // Releasing the stale lease must not free the new owner's key.
        lock.release(stale).await;
        assert!(
            lock.acquire(&keys(&["job"]), Duration::from_secs(30))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_panic() {
        let store = Arc::new(MemoryCache::new());
        let lock = DistributedLock::new(store);
        let ttl = Duration::from_secs(30);

        let inner = lock.clone();
        let outcome = tokio::spawn(async move {
            inner
                .with_lock(&keys(&["k"]), ttl, || async { panic!("boom") })
                .await
        })
        .await;
        assert!(outcome.is_err());

        let ran = lock
            .with_lock(&keys(&["k"]), ttl, || async { 7 })
            .await
            .unwrap();
        assert_eq!(ran, Some(7));
    }

    #[tokio::test]
    async fn test_with_lock_skips_when_busy() {
        let store = Arc::new(MemoryCache::new());
        let lock = DistributedLock::new(store);
        let ttl = Duration::from_secs(30);

        let _held = lock.acquire(&keys(&["k"]), ttl).await.unwrap().unwrap();
        let ran = lock
            .with_lock(&keys(&["k"]), ttl, || async { 1 })
            .await
            .unwrap();
        assert!(ran.is_none());
    }
}
