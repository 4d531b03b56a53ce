use sea_orm_migration::prelude::*;

use crate::database::entity::pending_closure;
use crate::database::entity::pending_object::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20260101_000004_create_pending_object_table"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Entity)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Column::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Column::PendingClosureId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Column::Key).text().not_null())
                    .col(ColumnDef::new(Column::Refs).text().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-pending-object-pending-closure")
                            .from(Entity, Column::PendingClosureId)
                            .to(pending_closure::Entity, pending_closure::Column::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-pending-object-pending-closure-id")
                    .table(Entity)
                    .col(Column::PendingClosureId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Entity).to_owned())
            .await
    }
}
