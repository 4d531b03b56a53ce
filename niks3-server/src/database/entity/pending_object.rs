//! An object declared as part of a pending closure, before it commits.

use sea_orm::entity::prelude::*;

use super::Json;

pub type PendingObjectModel = Model;

/// A pending object.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "pending_object")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    #[sea_orm(indexed)]
    pub pending_closure_id: i64,

    /// The object's storage key.
    #[sea_orm(column_type = "Text")]
    pub key: String,

    /// The keys of the objects this object will reference, once committed.
    pub refs: Json<Vec<String>>,
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
