//! Conflict repository
//!
//! Conflicts are written once in their final detection state. Manual resolution
//! is a conditional OPEN -> RESOLVED/IGNORED update so two operators cannot
//! both settle the same conflict.

use chrono::Utc;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, sea_query::Expr,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::enums::{ConflictStatus, ConflictStrategy};
use crate::models::sync_conflict::{ActiveModel, Column, Entity, Model};

/// Optional filters for conflict listings.
#[derive(Debug, Clone, Default)]
pub struct ConflictFilter {
    pub status: Option<ConflictStatus>,
    pub connection_id: Option<Uuid>,
    pub limit: Option<u64>,
}

/// Values written by a manual resolution.
#[derive(Debug, Clone)]
pub struct ConflictResolution {
    pub status: ConflictStatus,
    pub strategy: ConflictStrategy,
    pub outcome: Option<JsonValue>,
    pub resolved_by: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SyncConflictRepository {
    db: DatabaseConnection,
}

impl SyncConflictRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn insert(&self, conflict: ActiveModel) -> Result<Model, DbErr> {
        conflict.insert(&self.db).await
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(id).one(&self.db).await
    }

    /// Newest conflicts first.
    pub async fn list(&self, filter: ConflictFilter) -> Result<Vec<Model>, DbErr> {
        let mut query = Entity::find()
            .order_by_desc(Column::DetectedAt)
            .order_by_asc(Column::Id);
        if let Some(status) = filter.status {
            query = query.filter(Column::Status.eq(status));
        }
        if let Some(connection_id) = filter.connection_id {
            query = query.filter(Column::ConnectionId.eq(connection_id));
        }
        query
            .limit(filter.limit.unwrap_or(100))
            .all(&self.db)
            .await
    }

    /// OPEN -> resolution.status. Returns false when the conflict was not OPEN.
    pub async fn claim_resolution(
        &self,
        id: Uuid,
        resolution: ConflictResolution,
    ) -> Result<bool, DbErr> {
        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(resolution.status))
            .col_expr(Column::Strategy, Expr::value(resolution.strategy))
            .col_expr(Column::Outcome, Expr::value(resolution.outcome))
            .col_expr(Column::ResolvedBy, Expr::value(resolution.resolved_by))
            .col_expr(Column::Reason, Expr::value(resolution.reason))
            .col_expr(Column::ResolvedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(ConflictStatus::Open))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Undoes a claimed resolution whose record write failed.
    pub async fn reopen(&self, id: Uuid) -> Result<(), DbErr> {
        Entity::update_many()
            .col_expr(Column::Status, Expr::value(ConflictStatus::Open))
            .col_expr(Column::Outcome, Expr::value(Option::<JsonValue>::None))
            .col_expr(Column::ResolvedBy, Expr::value(Option::<String>::None))
            .col_expr(Column::Reason, Expr::value(Option::<String>::None))
            .col_expr(
                Column::ResolvedAt,
                Expr::value(Option::<DateTimeWithTimeZone>::None),
            )
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Marks the resolved record as pushed. Returns false if it already was.
    pub async fn mark_propagation_failed(&self, id: Uuid, error: &str) -> Result<(), DbErr> {
        Entity::update_many()
            .col_expr(Column::PropagationError, Expr::value(error.to_string()))
            .filter(Column::Id.eq(id))
            .filter(Column::PropagatedAt.is_null())
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn mark_propagated(&self, id: Uuid) -> Result<bool, DbErr> {
        let result = Entity::update_many()
            .col_expr(Column::PropagationError, Expr::value(Option::<String>::None))
            .col_expr(Column::PropagatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(id))
            .filter(Column::PropagatedAt.is_null())
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }
}
