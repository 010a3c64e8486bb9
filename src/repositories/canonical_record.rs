//! Canonical record repository: the platform's local copy of each synced resource.

use chrono::Utc;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{
    ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder, Set,
    sea_query::OnConflict,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::canonical_record::{ActiveModel, Column, Entity, Model};

#[derive(Debug, Clone)]
pub struct CanonicalRecordRepository {
    db: DatabaseConnection,
}

impl CanonicalRecordRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn get(
        &self,
        connection_id: Uuid,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Option<Model>, DbErr> {
        Entity::find()
            .filter(Column::ConnectionId.eq(connection_id))
            .filter(Column::ResourceType.eq(resource_type))
            .filter(Column::ResourceId.eq(resource_id))
            .one(&self.db)
            .await
    }

    /// Inserts or replaces the record stored under (connection, type, id).
    pub async fn upsert(
        &self,
        connection_id: Uuid,
        resource_type: &str,
        resource_id: &str,
        data: JsonValue,
        modified_at: Option<DateTimeWithTimeZone>,
    ) -> Result<(), DbErr> {
        let now = Utc::now().fixed_offset();
        let record = ActiveModel {
            id: Set(Uuid::new_v4()),
            connection_id: Set(connection_id),
            resource_type: Set(resource_type.to_string()),
            resource_id: Set(resource_id.to_string()),
            data: Set(data),
            modified_at: Set(modified_at),
            created_at: Set(now),
            updated_at: Set(now),
        };

        Entity::insert(record)
            .on_conflict(
                OnConflict::columns([
                    Column::ConnectionId,
                    Column::ResourceType,
                    Column::ResourceId,
                ])
                .update_columns([Column::Data, Column::ModifiedAt, Column::UpdatedAt])
                .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    /// Records of the given types written locally after `since`.
    pub async fn list_changed_since(
        &self,
        connection_id: Uuid,
        resource_types: &[String],
        since: Option<DateTimeWithTimeZone>,
    ) -> Result<Vec<Model>, DbErr> {
        let mut query = Entity::find()
            .filter(Column::ConnectionId.eq(connection_id))
            .order_by_asc(Column::ResourceType)
            .order_by_asc(Column::ResourceId);
        if !resource_types.is_empty() {
            query = query.filter(Column::ResourceType.is_in(resource_types.iter().cloned()));
        }
        if let Some(since) = since {
            query = query.filter(Column::UpdatedAt.gt(since));
        }
        query.all(&self.db).await
    }
}
