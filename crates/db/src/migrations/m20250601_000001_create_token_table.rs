//! Create `token` table migration.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Token::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Token::Contract)
                            .string_len(64)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Token::ChainId).big_integer().not_null())
                    .col(ColumnDef::new(Token::Standard).string_len(16).not_null())
                    .col(ColumnDef::new(Token::Name).string_len(256))
                    .col(ColumnDef::new(Token::Symbol).string_len(64))
                    .col(ColumnDef::new(Token::Decimals).integer())
                    .col(ColumnDef::new(Token::TotalSupply).text())
                    .col(
                        ColumnDef::new(Token::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Token::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Token::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum Token {
    Table,
    Contract,
    ChainId,
    Standard,
    Name,
    Symbol,
    Decimals,
    TotalSupply,
    CreatedAt,
    UpdatedAt,
}
