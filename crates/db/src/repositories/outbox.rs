//! Outbox repository.

use std::sync::Arc;

use crate::entities::{OutboxMessage, outbox_message};
use blockfeed_common::{AppError, AppResult};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect,
};

/// Outbox repository for database operations.
#[derive(Clone)]
pub struct OutboxRepository {
    db: Arc<DatabaseConnection>,
}

impl OutboxRepository {
    /// Create a new outbox repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Insert a captured message.
    pub async fn insert(&self, model: outbox_message::ActiveModel) -> AppResult<()> {
        OutboxMessage::insert(model)
            .exec_without_returning(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    /// Fetch up to `limit` records, oldest failure first.
    pub async fn find_oldest(&self, limit: u64) -> AppResult<Vec<outbox_message::Model>> {
        OutboxMessage::find()
            .order_by_asc(outbox_message::Column::FailedAt)
            .order_by_asc(outbox_message::Column::Id)
            .limit(limit)
            .all(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Delete records by id. Returns the number of deleted rows.
    pub async fn delete_by_ids(&self, ids: &[String]) -> AppResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = OutboxMessage::delete_many()
            .filter(outbox_message::Column::Id.is_in(ids.to_vec()))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result.rows_affected)
    }

    /// Count stored records.
    pub async fn count(&self) -> AppResult<u64> {
        OutboxMessage::find()
            .count(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult, Set};
    use serde_json::json;

    fn create_test_record(id: &str) -> outbox_message::Model {
        outbox_message::Model {
            id: id.to_string(),
            queue: "token-reindex".to_string(),
            message: json!({ "payload": { "contract": "0xa" } }),
            last_error: Some("connection refused".to_string()),
            failed_at: Utc::now().into(),
        }
    }

    #[tokio::test]
    async fn test_insert() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_exec_results([MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 1,
                }])
                .into_connection(),
        );

        let repo = OutboxRepository::new(db);
        let record = create_test_record("01j0");
        let model = outbox_message::ActiveModel {
            id: Set(record.id),
            queue: Set(record.queue),
            message: Set(record.message),
            last_error: Set(record.last_error),
            failed_at: Set(record.failed_at),
        };

        assert!(repo.insert(model).await.is_ok());
    }

    #[tokio::test]
    async fn test_find_oldest() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([[create_test_record("01a"), create_test_record("01b")]])
                .into_connection(),
        );

        let repo = OutboxRepository::new(db);
        let records = repo.find_oldest(10).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "01a");
    }

    #[tokio::test]
    async fn test_delete_by_ids() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_exec_results([MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 2,
                }])
                .into_connection(),
        );

        let repo = OutboxRepository::new(db);
        let deleted = repo
            .delete_by_ids(&["01a".to_string(), "01b".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 2);
    }
}
