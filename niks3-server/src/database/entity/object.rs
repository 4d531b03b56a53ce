//! A durable object: a NAR or narinfo that has survived a commit.
//!
//! Deletion is two-phase. `deleted_at` marks the object as provisionally
//! dead and is cleared if the object is resurrected by a later commit;
//! `first_deleted_at` is set once, never cleared, and is what the garbage
//! collector's grace period is measured against.

use sea_orm::entity::prelude::*;

use super::Json;

pub type ObjectModel = Model;

/// A durable object.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "object")]
pub struct Model {
    /// The object's storage key (NAR content-addressed key, or
    /// `<hash>.narinfo`).
    #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
    pub key: String,

    /// The keys of the objects this object references.
    pub refs: Json<Vec<String>>,

    /// Set when a mark phase finds this object unreachable; cleared if a
    /// later commit makes it reachable again.
    pub deleted_at: Option<ChronoDateTimeUtc>,

    /// Set the first time this object is marked unreachable. Never
    /// cleared. The sweep phase's grace period is measured from here.
    pub first_deleted_at: Option<ChronoDateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
