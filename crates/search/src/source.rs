//! Authoritative entity reads for the indexer.
//!
//! The indexer only trusts an event's key. Documents always come from a
//! fresh read through an [`EntitySource`].

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use blockfeed_common::AppResult;
use blockfeed_db::repositories::{ActivityRepository, TokenRepository};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::documents::{ActivityDocument, TokenDocument};
use crate::pending::Domain;

/// Reads current documents by natural key.
#[async_trait]
pub trait EntitySource: Send + Sync {
    fn domain(&self) -> Domain;

    /// Documents for the keys that still exist. Vanished keys are absent.
    async fn load(&self, keys: &[String]) -> AppResult<HashMap<String, Value>>;
}

/// Ordered walk over every natural key of a domain.
#[async_trait]
pub trait KeyScan: Send + Sync {
    /// Up to `limit` keys strictly after `cursor`, ascending.
    async fn keys_after(&self, cursor: Option<&str>, limit: u64) -> AppResult<Vec<String>>;
}

/// Token rows through [`TokenRepository`].
#[derive(Clone)]
pub struct TokenSource {
    repo: TokenRepository,
}

impl TokenSource {
    #[must_use]
    pub const fn new(repo: TokenRepository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl EntitySource for TokenSource {
    fn domain(&self) -> Domain {
        Domain::Tokens
    }

    async fn load(&self, keys: &[String]) -> AppResult<HashMap<String, Value>> {
        let mut documents = HashMap::with_capacity(keys.len());
        for model in self.repo.find_by_contracts(keys).await? {
            let document = serde_json::to_value(TokenDocument::from(&model))?;
            documents.insert(model.contract, document);
        }
        Ok(documents)
    }
}

#[async_trait]
impl KeyScan for TokenSource {
    async fn keys_after(&self, cursor: Option<&str>, limit: u64) -> AppResult<Vec<String>> {
        self.repo.list_contracts_after(cursor, limit).await
    }
}

/// Activity rows through [`ActivityRepository`].
#[derive(Clone)]
pub struct ActivitySource {
    repo: ActivityRepository,
}

impl ActivitySource {
    #[must_use]
    pub const fn new(repo: ActivityRepository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl EntitySource for ActivitySource {
    fn domain(&self) -> Domain {
        Domain::Activities
    }

    async fn load(&self, keys: &[String]) -> AppResult<HashMap<String, Value>> {
        let mut documents = HashMap::with_capacity(keys.len());
        for model in self.repo.find_by_ids(keys).await? {
            let document = serde_json::to_value(ActivityDocument::from(&model))?;
            documents.insert(model.id, document);
        }
        Ok(documents)
    }
}

/// In-process rows keyed by natural key, for tests and local runs.
pub struct MemorySource {
    domain: Domain,
    rows: Mutex<BTreeMap<String, Value>>,
    loads: Mutex<Vec<Vec<String>>>,
}

impl MemorySource {
    #[must_use]
    pub fn new(domain: Domain) -> Self {
        Self {
            domain,
            rows: Mutex::new(BTreeMap::new()),
            loads: Mutex::new(Vec::new()),
        }
    }

    pub async fn put(&self, key: impl Into<String>, document: Value) {
        self.rows.lock().await.insert(key.into(), document);
    }

    pub async fn delete(&self, key: &str) {
        self.rows.lock().await.remove(key);
    }

    /// Keys requested by each `load` call so far.
    pub async fn loads(&self) -> Vec<Vec<String>> {
        self.loads.lock().await.clone()
    }
}

#[async_trait]
impl EntitySource for MemorySource {
    fn domain(&self) -> Domain {
        self.domain
    }

    async fn load(&self, keys: &[String]) -> AppResult<HashMap<String, Value>> {
        self.loads.lock().await.push(keys.to_vec());
        let rows = self.rows.lock().await;
        Ok(keys
            .iter()
            .filter_map(|key| rows.get(key).map(|doc| (key.clone(), doc.clone())))
            .collect())
    }
}

#[async_trait]
impl KeyScan for MemorySource {
    async fn keys_after(&self, cursor: Option<&str>, limit: u64) -> AppResult<Vec<String>> {
        let rows = self.rows.lock().await;
        Ok(rows
            .keys()
            .filter(|key| cursor.is_none_or(|c| key.as_str() > c))
            .take(limit as usize)
            .cloned()
            .collect())
    }
}
