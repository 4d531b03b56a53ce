//! A pending closure: an in-flight commit started by `BeginPendingClosure`.

use sea_orm::entity::prelude::*;

pub type PendingClosureModel = Model;

/// A pending closure.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "pending_closure")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// The narinfo object key this pending closure will root, once
    /// committed.
    #[sea_orm(column_type = "Text", indexed)]
    pub key: String,

    /// When this pending closure was created. Used to find abandoned
    /// uploads past the configured timeout.
    pub started_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::pending_object::Entity")]
    PendingObject,
    #[sea_orm(has_many = "super::multipart_upload::Entity")]
    MultipartUpload,
}

impl Related<super::pending_object::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PendingObject.def()
    }
}

impl Related<super::multipart_upload::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::MultipartUpload.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
