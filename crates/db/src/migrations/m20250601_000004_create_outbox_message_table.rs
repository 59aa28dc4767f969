//! Create `outbox_message` table migration.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(OutboxMessage::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(OutboxMessage::Id)
                            .string_len(32)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(OutboxMessage::Queue).string_len(128).not_null())
                    .col(ColumnDef::new(OutboxMessage::Message).json_binary().not_null())
                    .col(ColumnDef::new(OutboxMessage::LastError).text())
                    .col(
                        ColumnDef::new(OutboxMessage::FailedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Recovery reads the oldest records first
        manager
            .create_index(
                Index::create()
                    .name("idx_outbox_message_failed_at")
                    .table(OutboxMessage::Table)
                    .col(OutboxMessage::FailedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(OutboxMessage::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum OutboxMessage {
    Table,
    Id,
    Queue,
    Message,
    LastError,
    FailedAt,
}
