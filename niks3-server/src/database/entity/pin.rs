//! A named pin, protecting a closure from age-based deletion.

use sea_orm::entity::prelude::*;

pub type PinModel = Model;

/// A pin.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "pin")]
pub struct Model {
    /// The pin's user-assigned name.
    #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
    pub name: String,

    /// The narinfo key of the closure this pin protects.
    #[sea_orm(column_type = "Text", indexed)]
    pub narinfo_key: String,

    /// The store path the pin was created for, for display purposes.
    #[sea_orm(column_type = "Text")]
    pub store_path: String,

    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
