//! Search documents.
//!
//! Documents are pure functions of the entity row: building the same row
//! twice yields the same document, so a retried write is idempotent.

use blockfeed_db::entities::{activity, token};
use serde::{Deserialize, Serialize};

use crate::pending::Domain;

/// Stable document id of `key` in `domain`.
#[must_use]
pub fn document_id(domain: Domain, key: &str) -> String {
    format!("{}:{key}", domain.document_prefix())
}

/// Document representing a token contract in the search index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenDocument {
    /// Document id (`token:{contract}`)
    pub id: String,
    /// Contract address
    pub contract: String,
    pub chain_id: i64,
    /// Token standard
    pub standard: String,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub decimals: Option<i32>,
    /// Total supply as a decimal string
    pub total_supply: Option<String>,
    /// Last row update (Unix epoch seconds)
    pub updated_at: i64,
}

impl From<&token::Model> for TokenDocument {
    fn from(model: &token::Model) -> Self {
        Self {
            id: document_id(Domain::Tokens, &model.contract),
            contract: model.contract.clone(),
            chain_id: model.chain_id,
            standard: model.standard.clone(),
            name: model.name.clone(),
            symbol: model.symbol.clone(),
            decimals: model.decimals,
            total_supply: model.total_supply.clone(),
            updated_at: model.updated_at.timestamp(),
        }
    }
}

/// Document representing a token activity in the search index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityDocument {
    /// Document id (`activity:{id}`)
    pub id: String,
    /// Activity row id
    pub activity_id: String,
    pub chain_id: i64,
    /// Transfer, mint, burn or sale
    pub kind: String,
    pub contract: String,
    pub token_id: Option<String>,
    pub tx_hash: String,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    /// Amount as a decimal string
    pub amount: String,
    pub block_number: Option<i64>,
    /// Block time (Unix epoch seconds)
    pub block_timestamp: Option<i64>,
    /// Transaction sender, once joined
    pub tx_sender: Option<String>,
    /// Whether block data has been joined in
    pub joined: bool,
    /// Creation timestamp (Unix epoch seconds)
    pub created_at: i64,
}

impl From<&activity::Model> for ActivityDocument {
    fn from(model: &activity::Model) -> Self {
        Self {
            id: document_id(Domain::Activities, &model.id),
            activity_id: model.id.clone(),
            chain_id: model.chain_id,
            kind: model.kind.clone(),
            contract: model.contract.clone(),
            token_id: model.token_id.clone(),
            tx_hash: model.tx_hash.clone(),
            from_address: model.from_address.clone(),
            to_address: model.to_address.clone(),
            amount: model.amount.clone(),
            block_number: model.block_number,
            block_timestamp: model.block_timestamp.map(|t| t.timestamp()),
            tx_sender: model.tx_sender.clone(),
            joined: model.is_joined(),
            created_at: model.created_at.timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn activity() -> activity::Model {
        let now = Utc::now().into();
        activity::Model {
            id: "act1".to_string(),
            chain_id: 1,
            kind: "transfer".to_string(),
            contract: "0xabc".to_string(),
            token_id: None,
            tx_hash: "0xtx".to_string(),
            from_address: Some("0x1".to_string()),
            to_address: Some("0x2".to_string()),
            amount: "1000".to_string(),
            block_number: None,
            block_timestamp: None,
            tx_sender: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_activity_document_is_deterministic() {
        let model = activity();
        let a = ActivityDocument::from(&model);
        let b = ActivityDocument::from(&model);

        assert_eq!(a, b);
        assert_eq!(a.id, "activity:act1");
        assert!(!a.joined);
    }

    #[test]
    fn test_document_serializes_camel_case() {
        let doc = serde_json::to_value(ActivityDocument::from(&activity())).unwrap();
        assert_eq!(doc["txHash"], "0xtx");
        assert!(doc.get("tx_hash").is_none());
    }
}
