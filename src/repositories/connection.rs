//! Connection repository
//!
//! Read access to the connection directory plus the few writes the sync engine
//! performs on it (recording the last successful sync).

use chrono::Utc;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set, sea_query::Expr,
};
use uuid::Uuid;

use crate::models::connection::{ActiveModel, Column, Entity, Model};
use crate::models::enums::ConnectionStatus;

/// Repository for connection database operations
#[derive(Debug, Clone)]
pub struct ConnectionRepository {
    db: DatabaseConnection,
}

impl ConnectionRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(id).one(&self.db).await
    }

    /// Returns the connection only when its status is ACTIVE.
    pub async fn find_active(&self, id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(id)
            .filter(Column::Status.eq(ConnectionStatus::Active))
            .one(&self.db)
            .await
    }

    /// All active connections, oldest sync first.
    pub async fn list_active(&self) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::Status.eq(ConnectionStatus::Active))
            .order_by_asc(Column::LastSyncedAt)
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await
    }

    pub async fn insert(&self, model: ActiveModel) -> Result<Model, DbErr> {
        model.insert(&self.db).await
    }

    /// Records the completion time of a successful sync.
    pub async fn mark_synced(&self, id: Uuid, at: DateTimeWithTimeZone) -> Result<(), DbErr> {
        Entity::update_many()
            .col_expr(Column::LastSyncedAt, Expr::value(at))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn set_status(&self, id: Uuid, status: ConnectionStatus) -> Result<(), DbErr> {
        let Some(connection) = self.find_by_id(id).await? else {
            return Err(DbErr::RecordNotFound(format!("connection {id}")));
        };
        let mut active: ActiveModel = connection.into();
        active.status = Set(status);
        active.updated_at = Set(Utc::now().fixed_offset());
        active.update(&self.db).await?;
        Ok(())
    }
}
