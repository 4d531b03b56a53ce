//! A multipart upload opened on behalf of a pending closure.
//!
//! Tracked so an abandoned pending closure's in-flight S3 multipart
//! uploads can be aborted by the garbage collector instead of leaking
//! storage indefinitely.

use sea_orm::entity::prelude::*;

pub type MultipartUploadModel = Model;

/// A multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "multipart_upload")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    #[sea_orm(indexed)]
    pub pending_closure_id: i64,

    /// The object key the multipart upload targets.
    #[sea_orm(column_type = "Text")]
    pub object_key: String,

    /// The S3 upload ID.
    #[sea_orm(column_type = "Text")]
    pub upload_id: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::pending_closure::Entity",
        from = "Column::PendingClosureId",
        to = "super::pending_closure::Column::Id",
        on_delete = "Cascade"
    )]
    PendingClosure,
}

impl Related<super::pending_closure::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PendingClosure.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
