//! A closure: a reachability root keyed by its narinfo object key.

use sea_orm::entity::prelude::*;

pub type ClosureModel = Model;

/// A closure.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "closure")]
pub struct Model {
    /// The narinfo object key that roots this closure, e.g.
    /// `<32-char hash>.narinfo`.
    #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
    pub key: String,

    /// Timestamp of the most recent commit that touched this closure.
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
