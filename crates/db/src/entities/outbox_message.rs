//! Outbox entity: messages whose publish attempt failed.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A message waiting to be republished to its queue.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "outbox_message")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Target queue name.
    #[sea_orm(indexed)]
    pub queue: String,

    /// Serialized job message.
    #[sea_orm(column_type = "JsonBinary")]
    pub message: Json,

    /// Publish error that caused the capture.
    #[sea_orm(column_type = "Text", nullable)]
    pub last_error: Option<String>,

    #[sea_orm(indexed)]
    pub failed_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
