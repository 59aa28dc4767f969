//! Token contract entity.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A token contract discovered on chain.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "token")]
pub struct Model {
    /// Contract address, lowercase hex.
    #[sea_orm(primary_key, auto_increment = false)]
    pub contract: String,

    pub chain_id: i64,

    /// Token standard (erc20, erc721, erc1155).
    pub standard: String,

    #[sea_orm(nullable)]
    pub name: Option<String>,

    #[sea_orm(nullable)]
    pub symbol: Option<String>,

    #[sea_orm(nullable)]
    pub decimals: Option<i32>,

    /// Total supply as a decimal string (exceeds 64 bits).
    #[sea_orm(column_type = "Text", nullable)]
    pub total_supply: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
