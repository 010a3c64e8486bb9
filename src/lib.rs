//! # EHR Sync Library
//!
//! Bidirectional synchronization between EHR providers and the canonical
//! record store: job orchestration, provider adapters, conflict handling,
//! webhook ingestion and delivery, and the HTTP API on top of them.

pub mod adapters;
pub mod auth;
pub mod collaborators;
pub mod config;
pub mod conflicts;
pub mod crypto;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod handlers;
pub mod maintenance;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod queue;
pub mod repositories;
pub mod scheduler;
pub mod server;
pub mod statistics;
pub mod telemetry;
pub mod webhooks;
pub use migration;
