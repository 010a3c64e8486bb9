//! SyncStatistics entity model: daily counters per (day, provider, connection).

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::{Date, DateTimeWithTimeZone};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_statistics")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub day: Date,

    pub provider_slug: String,

    pub connection_id: Uuid,

    pub jobs_completed: i64,
    pub jobs_failed: i64,
    pub records_processed: i64,
    pub records_transformed: i64,
    pub records_failed: i64,
    pub conflicts_detected: i64,
    pub conflicts_resolved: i64,
    pub bytes_transferred: i64,
    pub total_duration_ms: i64,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
