//! # EHR Sync Main Entry Point

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ehr_sync::{config::ConfigLoader, db, engine::Engine, server::run_server, telemetry};

#[derive(Parser)]
#[command(name = "ehr-sync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run migrations, start the engine and serve the API (default)
    Serve,
    /// Apply pending database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing tracing")?;

    tracing::info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        tracing::debug!(config = %redacted_json, "Effective configuration");
    }

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;
    db::run_migrations(&db)
        .await
        .context("applying database migrations")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Migrate => {
            tracing::info!("Migrations applied");
            Ok(())
        }
        Command::Serve => {
            let engine = Arc::new(Engine::new(config, db).context("assembling sync engine")?);
            engine.start().await.context("starting sync engine")?;
            run_server(engine)
                .await
                .map_err(|error| anyhow::anyhow!("server error: {error}"))
        }
    }
}
