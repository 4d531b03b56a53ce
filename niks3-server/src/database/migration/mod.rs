//! Database migrations.

pub use sea_orm_migration::*;

mod m20260101_000001_create_closure_table;
mod m20260101_000002_create_object_table;
mod m20260101_000003_create_pending_closure_table;
mod m20260101_000004_create_pending_object_table;
mod m20260101_000005_create_multipart_upload_table;
mod m20260101_000006_create_pin_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260101_000001_create_closure_table::Migration),
            Box::new(m20260101_000002_create_object_table::Migration),
            Box::new(m20260101_000003_create_pending_closure_table::Migration),
            Box::new(m20260101_000004_create_pending_object_table::Migration),
            Box::new(m20260101_000005_create_multipart_upload_table::Migration),
            Box::new(m20260101_000006_create_pin_table::Migration),
        ]
    }
}
