//! Token activity entity (transfers, mints, burns, sales).

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A decoded token activity.
///
/// `block_number`, `block_timestamp` and `tx_sender` are copied from the
/// referenced transaction once it is available.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "activity")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub chain_id: i64,

    /// Activity kind (transfer, mint, burn, sale).
    pub kind: String,

    #[sea_orm(indexed)]
    pub contract: String,

    #[sea_orm(nullable)]
    pub token_id: Option<String>,

    #[sea_orm(indexed)]
    pub tx_hash: String,

    #[sea_orm(nullable)]
    pub from_address: Option<String>,

    #[sea_orm(nullable)]
    pub to_address: Option<String>,

    #[sea_orm(column_type = "Text")]
    pub amount: String,

    #[sea_orm(nullable)]
    pub block_number: Option<i64>,

    #[sea_orm(nullable)]
    pub block_timestamp: Option<DateTimeWithTimeZone>,

    #[sea_orm(nullable)]
    pub tx_sender: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Whether the transaction fields have been joined in.
    #[must_use]
    pub const fn is_joined(&self) -> bool {
        self.block_number.is_some()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
