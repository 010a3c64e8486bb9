//! Database migrations for the EHR sync engine.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2026_01_05_090000_create_connections;
mod m2026_01_05_090100_create_sync_jobs;
mod m2026_01_05_090200_create_sync_errors;
mod m2026_01_05_090300_create_sync_conflicts;
mod m2026_01_05_090400_create_webhooks;
mod m2026_01_05_090500_create_transformation_rules;
mod m2026_01_05_090600_create_sync_statistics;
mod m2026_01_05_090700_create_canonical_records;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_01_05_090000_create_connections::Migration),
            Box::new(m2026_01_05_090100_create_sync_jobs::Migration),
            Box::new(m2026_01_05_090200_create_sync_errors::Migration),
            Box::new(m2026_01_05_090300_create_sync_conflicts::Migration),
            Box::new(m2026_01_05_090400_create_webhooks::Migration),
            Box::new(m2026_01_05_090500_create_transformation_rules::Migration),
            Box::new(m2026_01_05_090600_create_sync_statistics::Migration),
            Box::new(m2026_01_05_090700_create_canonical_records::Migration),
        ]
    }
}
