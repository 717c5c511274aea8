use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use feedsync_storage::PgRecordStore;
use feedsync_sync::{maybe_build_scheduler, SyncConfig, SyncOutcome, SyncRuntime};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "feedsync")]
#[command(about = "Page feed sync engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync now.
    Sync {
        /// Ignore the cooldown window.
        #[arg(long)]
        force: bool,
    },
    /// Print cooldown and last-sync state.
    Status,
    /// Apply database migrations.
    Migrate,
    /// Serve the HTTP trigger surfaces.
    Serve,
    /// Run scheduled syncs until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,feedsync=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { force: false }) {
        Commands::Sync { force } => {
            let outcome = feedsync_sync::run_sync_once_from_env(force).await?;
            match outcome {
                SyncOutcome::Completed(result) => println!(
                    "sync complete: fetched={} inserted={} duplicates={} unparseable={} failed={}",
                    result.fetched,
                    result.inserted,
                    result.skipped_duplicate,
                    result.skipped_unparseable,
                    result.failed
                ),
                SyncOutcome::Skipped { remaining_ms } => println!(
                    "sync skipped: cooldown active for another {}s (use --force to override)",
                    (remaining_ms + 999) / 1000
                ),
            }
        }
        Commands::Status => {
            let runtime = SyncRuntime::from_env().await?;
            let status = runtime.orchestrator.status();
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgRecordStore::connect(&config.database_url).await?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            feedsync_web::serve_from_env().await?;
        }
        Commands::Schedule => {
            let runtime = SyncRuntime::from_env().await?;
            let Some(sched) =
                maybe_build_scheduler(&runtime.config, Arc::clone(&runtime.orchestrator)).await?
            else {
                bail!("scheduler disabled; set FEEDSYNC_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            tracing::info!(cron = %runtime.config.sync_cron, "sync scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            tracing::info!("shutting down");
        }
    }

    Ok(())
}
