//! # Repository Layer
//!
//! This module contains repository implementations that encapsulate SeaORM operations
//! for database entities. Repositories return `DbErr`; callers decide how a database
//! failure maps onto their own error type.

pub mod canonical_record;
pub mod connection;
pub mod sync_conflict;
pub mod sync_error;
pub mod sync_job;
pub mod sync_statistics;
pub mod transformation_rule;
pub mod webhook_config;
pub mod webhook_log;

pub use canonical_record::CanonicalRecordRepository;
pub use connection::ConnectionRepository;
pub use sync_conflict::SyncConflictRepository;
pub use sync_error::SyncErrorRepository;
pub use sync_job::SyncJobRepository;
pub use sync_statistics::SyncStatisticsRepository;
pub use transformation_rule::TransformationRuleRepository;
pub use webhook_config::WebhookConfigRepository;
pub use webhook_log::WebhookLogRepository;
