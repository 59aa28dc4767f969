//! Token repository.

use std::sync::Arc;

use crate::entities::{Token, token};
use blockfeed_common::{AppError, AppResult};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect};

/// Token repository for database operations.
#[derive(Clone)]
pub struct TokenRepository {
    db: Arc<DatabaseConnection>,
}

impl TokenRepository {
    /// Create a new token repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Find a token by contract address.
    pub async fn find_by_contract(&self, contract: &str) -> AppResult<Option<token::Model>> {
        Token::find_by_id(contract)
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Find all tokens whose contract is in `contracts`.
    pub async fn find_by_contracts(&self, contracts: &[String]) -> AppResult<Vec<token::Model>> {
        if contracts.is_empty() {
            return Ok(vec![]);
        }

        Token::find()
            .filter(token::Column::Contract.is_in(contracts.to_vec()))
            .all(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// List contract addresses strictly after `cursor`, ordered by contract.
    ///
    /// Used by cursor-driven backfills; `None` starts from the beginning.
    pub async fn list_contracts_after(
        &self,
        cursor: Option<&str>,
        limit: u64,
    ) -> AppResult<Vec<String>> {
        let mut query = Token::find()
            .select_only()
            .column(token::Column::Contract)
            .order_by_asc(token::Column::Contract)
            .limit(limit);

        if let Some(cursor) = cursor {
            query = query.filter(token::Column::Contract.gt(cursor));
        }

        query
            .into_tuple::<String>()
            .all(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }
}
