//! Migration to create the slot_lease table

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SlotLease::Table)
                    .if_not_exists()
                    .col(string_len(SlotLease::Key, 255).primary_key())
                    .col(string_len(SlotLease::AgentId, 255).not_null())
                    .col(timestamp_with_time_zone(SlotLease::ExpiresAt).not_null())
                    .to_owned(),
            )
            .await?;

        // Expired leases are swept by deadline
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_slot_lease_expires_at")
                    .table(SlotLease::Table)
                    .col(SlotLease::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SlotLease::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SlotLease {
    #[sea_orm(iden = "slot_lease")]
    Table,
    Key,
    AgentId,
    ExpiresAt,
}
