//! TransformationRule entity model
//!
//! Each row stores one versioned rule document; decoding into typed rules
//! happens in [`crate::pipeline::rules`].

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "transformation_rules")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub provider_slug: String,

    pub resource_type: String,

    /// Lower values apply first
    pub priority: i32,

    pub schema_version: i32,

    #[sea_orm(column_type = "JsonBinary")]
    pub rule: JsonValue,

    pub active: bool,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
