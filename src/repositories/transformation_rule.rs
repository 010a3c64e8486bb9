//! Transformation rule repository

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::transformation_rule::{ActiveModel, Column, Entity, Model};

#[derive(Debug, Clone)]
pub struct TransformationRuleRepository {
    db: DatabaseConnection,
}

impl TransformationRuleRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn insert(
        &self,
        provider_slug: &str,
        resource_type: &str,
        priority: i32,
        rule: JsonValue,
    ) -> Result<Model, DbErr> {
        let schema_version = rule
            .get("schemaVersion")
            .and_then(JsonValue::as_i64)
            .unwrap_or(1) as i32;
        ActiveModel {
            id: Set(Uuid::new_v4()),
            provider_slug: Set(provider_slug.to_string()),
            resource_type: Set(resource_type.to_string()),
            priority: Set(priority),
            schema_version: Set(schema_version),
            rule: Set(rule),
            active: Set(true),
            created_at: Set(Utc::now().fixed_offset()),
        }
        .insert(&self.db)
        .await
    }

    /// Active rules for (provider, resource type) in application order.
    pub async fn list_active(
        &self,
        provider_slug: &str,
        resource_type: &str,
    ) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::ProviderSlug.eq(provider_slug))
            .filter(Column::ResourceType.eq(resource_type))
            .filter(Column::Active.eq(true))
            .order_by_asc(Column::Priority)
            .order_by_asc(Column::CreatedAt)
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await
    }
}
