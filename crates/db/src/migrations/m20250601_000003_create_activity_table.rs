//! Create `activity` table migration.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Activity::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Activity::Id)
                            .string_len(32)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Activity::ChainId).big_integer().not_null())
                    .col(ColumnDef::new(Activity::Kind).string_len(16).not_null())
                    .col(ColumnDef::new(Activity::Contract).string_len(64).not_null())
                    .col(ColumnDef::new(Activity::TokenId).string_len(80))
                    .col(ColumnDef::new(Activity::TxHash).string_len(80).not_null())
                    .col(ColumnDef::new(Activity::FromAddress).string_len(64))
                    .col(ColumnDef::new(Activity::ToAddress).string_len(64))
                    .col(ColumnDef::new(Activity::Amount).text().not_null())
                    .col(ColumnDef::new(Activity::BlockNumber).big_integer())
                    .col(ColumnDef::new(Activity::BlockTimestamp).timestamp_with_time_zone())
                    .col(ColumnDef::new(Activity::TxSender).string_len(64))
                    .col(
                        ColumnDef::new(Activity::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Activity::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_activity_contract")
                    .table(Activity::Table)
                    .col(Activity::Contract)
                    .to_owned(),
            )
            .await?;

        // Joins look activities up by transaction hash
        manager
            .create_index(
                Index::create()
                    .name("idx_activity_tx_hash")
                    .table(Activity::Table)
                    .col(Activity::TxHash)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Activity::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum Activity {
    Table,
    Id,
    ChainId,
    Kind,
    Contract,
    TokenId,
    TxHash,
    FromAddress,
    ToAddress,
    Amount,
    BlockNumber,
    BlockTimestamp,
    TxSender,
    CreatedAt,
    UpdatedAt,
}
