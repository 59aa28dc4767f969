//! Transaction repository.

use std::sync::Arc;

use crate::entities::{Transaction, transaction};
use blockfeed_common::{AppError, AppResult};
use sea_orm::{DatabaseConnection, EntityTrait};

/// Transaction repository for database operations.
#[derive(Clone)]
pub struct TransactionRepository {
    db: Arc<DatabaseConnection>,
}

impl TransactionRepository {
    /// Create a new transaction repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Find a transaction by hash.
    pub async fn find_by_hash(&self, hash: &str) -> AppResult<Option<transaction::Model>> {
        Transaction::find_by_id(hash)
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sea_orm::{DatabaseBackend, MockDatabase};

    #[tokio::test]
    async fn test_find_by_hash() {
        let tx = transaction::Model {
            hash: "0xabc".to_string(),
            chain_id: 1,
            block_number: 19_000_000,
            block_timestamp: Utc::now().into(),
            from_address: "0xsender".to_string(),
            to_address: Some("0xc02a".to_string()),
            value: "0".to_string(),
            created_at: Utc::now().into(),
        };

        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([[tx.clone()]])
                .into_connection(),
        );

        let repo = TransactionRepository::new(db);
        let found = repo.find_by_hash("0xabc").await.unwrap().unwrap();
        assert_eq!(found.block_number, 19_000_000);
    }
}
