//! On-chain transaction entity.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A mined transaction.
///
/// Rows land independently of the activities that reference them, so an
/// activity may exist before its transaction does.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "chain_transaction")]
pub struct Model {
    /// Transaction hash, lowercase hex.
    #[sea_orm(primary_key, auto_increment = false)]
    pub hash: String,

    pub chain_id: i64,

    #[sea_orm(indexed)]
    pub block_number: i64,

    pub block_timestamp: DateTimeWithTimeZone,

    pub from_address: String,

    #[sea_orm(nullable)]
    pub to_address: Option<String>,

    /// Native value transferred, decimal string.
    #[sea_orm(column_type = "Text")]
    pub value: String,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
