//! Key-value cache used for locks and pending-event lists.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use fred::clients::Client as RedisClient;
use fred::interfaces::{KeysInterface, ListInterface, LuaInterface};
use fred::types::{Expiration, SetOptions};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Cache errors.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(String),
    #[error("Wrong value type at key {0}")]
    WrongType(String),
}

impl From<fred::error::Error> for CacheError {
    fn from(err: fred::error::Error) -> Self {
        Self::Redis(err.to_string())
    }
}

impl From<CacheError> for blockfeed_common::AppError {
    fn from(err: CacheError) -> Self {
        Self::Redis(err.to_string())
    }
}

/// Minimal cache surface.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Append to a list. Returns the new length.
    async fn rpush(&self, key: &str, values: Vec<String>) -> Result<u64, CacheError>;

    /// Pop up to `count` entries from the head of a list.
    async fn lpop(&self, key: &str, count: usize) -> Result<Vec<String>, CacheError>;

    async fn llen(&self, key: &str) -> Result<u64, CacheError>;

    /// Set `key` only if absent, expiring after `ttl`. Returns whether it was set.
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Delete `key` only while it still holds `value`.
    async fn del_if_eq(&self, key: &str, value: &str) -> Result<bool, CacheError>;
}

const DEL_IF_EQ_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// Redis-backed cache.
#[derive(Clone)]
pub struct RedisCache {
    client: RedisClient,
    prefix: String,
}

impl RedisCache {
    /// Create a cache whose keys are prefixed with `{prefix}:`.
    #[must_use]
    pub fn new(client: RedisClient, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.client.get(self.key(key)).await?)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.client
            .set::<(), _, _>(
                self.key(key),
                value,
                Some(Expiration::EX(ttl.as_secs().max(1) as i64)),
                None,
                false,
            )
            .await?;
        Ok(())
    }

    async fn rpush(&self, key: &str, values: Vec<String>) -> Result<u64, CacheError> {
        if values.is_empty() {
            return self.llen(key).await;
        }
        Ok(self.client.rpush(self.key(key), values).await?)
    }

    async fn lpop(&self, key: &str, count: usize) -> Result<Vec<String>, CacheError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let popped: Option<Vec<String>> = self.client.lpop(self.key(key), Some(count)).await?;
        Ok(popped.unwrap_or_default())
    }

    async fn llen(&self, key: &str) -> Result<u64, CacheError> {
        Ok(self.client.llen(self.key(key)).await?)
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        let set: Option<String> = self
            .client
            .set(
                self.key(key),
                value,
                Some(Expiration::PX(ttl.as_millis() as i64)),
                Some(SetOptions::NX),
                false,
            )
            .await?;
        Ok(set.is_some())
    }

    async fn del_if_eq(&self, key: &str, value: &str) -> Result<bool, CacheError> {
        let deleted: i64 = self
            .client
            .eval(DEL_IF_EQ_SCRIPT, vec![self.key(key)], vec![value.to_string()])
            .await?;
        Ok(deleted == 1)
    }
}

enum Entry {
    Value {
        value: String,
        expires_at: Option<Instant>,
    },
    List(VecDeque<String>),
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self, Self::Value { expires_at: Some(at), .. } if *at <= now)
    }
}

/// In-process cache with the same semantics as [`RedisCache`].
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn purge_expired(entries: &mut HashMap<String, Entry>, key: &str) {
    if entries.get(key).is_some_and(|e| e.is_expired(Instant::now())) {
        entries.remove(key);
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key);
        match entries.get(key) {
            None => Ok(None),
            Some(Entry::Value { value, .. }) => Ok(Some(value.clone())),
            Some(Entry::List(_)) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry::Value {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn rpush(&self, key: &str, values: Vec<String>) -> Result<u64, CacheError> {
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key);
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::List(VecDeque::new()));
        match entry {
            Entry::List(list) => {
                list.extend(values);
                Ok(list.len() as u64)
            }
            Entry::Value { .. } => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn lpop(&self, key: &str, count: usize) -> Result<Vec<String>, CacheError> {
        let mut entries = self.entries.lock().await;
        let popped = match entries.get_mut(key) {
            None => return Ok(Vec::new()),
            Some(Entry::List(list)) => {
                let n = count.min(list.len());
                list.drain(..n).collect::<Vec<_>>()
            }
            Some(Entry::Value { .. }) => return Err(CacheError::WrongType(key.to_string())),
        };
        if matches!(entries.get(key), Some(Entry::List(list)) if list.is_empty()) {
            entries.remove(key);
        }
        Ok(popped)
    }

    async fn llen(&self, key: &str) -> Result<u64, CacheError> {
        let entries = self.entries.lock().await;
        match entries.get(key) {
            None => Ok(0),
            Some(Entry::List(list)) => Ok(list.len() as u64),
            Some(Entry::Value { .. }) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry::Value {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn del_if_eq(&self, key: &str, value: &str) -> Result<bool, CacheError> {
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key);
        let matches = matches!(entries.get(key), Some(Entry::Value { value: v, .. }) if v == value);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }
}
