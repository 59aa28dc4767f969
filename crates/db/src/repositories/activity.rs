//! Activity repository.

use std::sync::Arc;

use crate::entities::{Activity, activity, transaction};
use blockfeed_common::{AppError, AppResult};
use chrono::Utc;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, sea_query::Expr};

/// Activity repository for database operations.
#[derive(Clone)]
pub struct ActivityRepository {
    db: Arc<DatabaseConnection>,
}

impl ActivityRepository {
    /// Create a new activity repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Find an activity by ID.
    pub async fn find_by_id(&self, id: &str) -> AppResult<Option<activity::Model>> {
        Activity::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Find all activities whose id is in `ids`.
    pub async fn find_by_ids(&self, ids: &[String]) -> AppResult<Vec<activity::Model>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        Activity::find()
            .filter(activity::Column::Id.is_in(ids.to_vec()))
            .all(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Copy block and sender fields from `tx` into the activity.
    ///
    /// Only touches rows that are not joined yet, so a redelivered join is a
    /// no-op. Returns whether a row was updated.
    pub async fn attach_transaction(
        &self,
        activity_id: &str,
        tx: &transaction::Model,
    ) -> AppResult<bool> {
        let result = Activity::update_many()
            .col_expr(activity::Column::BlockNumber, Expr::value(tx.block_number))
            .col_expr(
                activity::Column::BlockTimestamp,
                Expr::value(tx.block_timestamp),
            )
            .col_expr(
                activity::Column::TxSender,
                Expr::value(tx.from_address.clone()),
            )
            .col_expr(activity::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(activity::Column::Id.eq(activity_id))
            .filter(activity::Column::BlockNumber.is_null())
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result.rows_affected > 0)
    }
}
