//! Create `chain_transaction` table migration.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ChainTransaction::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ChainTransaction::Hash)
                            .string_len(80)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ChainTransaction::ChainId).big_integer().not_null())
                    .col(
                        ColumnDef::new(ChainTransaction::BlockNumber)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ChainTransaction::BlockTimestamp)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ChainTransaction::FromAddress)
                            .string_len(64)
                            .not_null(),
                    )
                    .col(ColumnDef::new(ChainTransaction::ToAddress).string_len(64))
                    .col(ColumnDef::new(ChainTransaction::Value).text().not_null())
                    .col(
                        ColumnDef::new(ChainTransaction::CreatedAt)
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
                    .name("idx_chain_transaction_block_number")
                    .table(ChainTransaction::Table)
                    .col(ChainTransaction::BlockNumber)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ChainTransaction::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum ChainTransaction {
    Table,
    Hash,
    ChainId,
    BlockNumber,
    BlockTimestamp,
    FromAddress,
    ToAddress,
    Value,
    CreatedAt,
}
