use anyhow::{Context, Result};
use carewatch_core::DatasetKind;
use carewatch_storage::{connect_pool, run_migrations};
use carewatch_sync::{
    maybe_build_scheduler, recalculate_aggregates, run_full_sync, run_single_dataset, SyncConfig,
    SyncContext,
};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "carewatch")]
#[command(about = "Childcare facility compliance data sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync facilities, inspections, and violations, then rebuild aggregates.
    SyncAll,
    /// Sync only the facilities dataset.
    Facilities,
    /// Sync only the inspection events dataset.
    Inspections,
    /// Sync only the violation records dataset.
    Violations,
    /// Rebuild per-facility risk aggregates from current child rows.
    Aggregate,
    /// Apply embedded database migrations.
    Migrate,
    /// Run resident, firing scheduled full syncs per CAREWATCH_SYNC_CRON.
    Watch,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping after the current page");
            interrupt.cancel();
        }
    });

    // Degraded completion still exits 0; only a top-level fault before any
    // progress exits 1.
    match run(cli.command.unwrap_or(Commands::SyncAll), &cancel).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("carewatch: {err:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, cancel: &CancellationToken) -> Result<()> {
    let config = SyncConfig::from_env();

    match command {
        Commands::Migrate => {
            let pool = connect_pool(&config.database_url, config.max_db_connections)
                .await
                .context("connecting to database")?;
            run_migrations(&pool).await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Aggregate => {
            let ctx = SyncContext::new(config).await?;
            let summary = recalculate_aggregates(&ctx.pool).await?;
            println!(
                "aggregation complete: seen={} updated={} unchanged={} missing={}",
                summary.facilities_seen,
                summary.facilities_updated,
                summary.facilities_unchanged,
                summary.facilities_missing
            );
        }
        Commands::SyncAll => {
            let ctx = SyncContext::new(config).await?;
            let run = run_full_sync(&ctx, cancel).await?;
            println!(
                "sync {}: run_id={} datasets={} reports={}",
                run.status.as_str(),
                run.run_id,
                run.datasets.len(),
                run.reports_dir.as_deref().unwrap_or("-")
            );
        }
        Commands::Facilities => sync_one(config, DatasetKind::Facilities, cancel).await?,
        Commands::Inspections => sync_one(config, DatasetKind::Inspections, cancel).await?,
        Commands::Violations => sync_one(config, DatasetKind::Violations, cancel).await?,
        Commands::Watch => {
            let mut config = config;
            config.scheduler_enabled = true;
            if let Some(mut scheduler) = maybe_build_scheduler(&config).await? {
                scheduler.start().await.context("starting scheduler")?;
                info!(cron = %config.sync_cron, "scheduler running, Ctrl-C to stop");
                cancel.cancelled().await;
                scheduler.shutdown().await.ok();
            }
        }
    }

    Ok(())
}

async fn sync_one(config: SyncConfig, kind: DatasetKind, cancel: &CancellationToken) -> Result<()> {
    let ctx = SyncContext::new(config).await?;
    let summary = run_single_dataset(&ctx, kind, cancel).await?;
    println!(
        "{} sync {}: fetched={} inserted={} updated={} unchanged={} skipped={} pages_abandoned={}",
        summary.dataset,
        summary.status.as_str(),
        summary.records_fetched,
        summary.records_inserted,
        summary.records_updated,
        summary.records_unchanged,
        summary.records_skipped,
        summary.pages_abandoned
    );
    Ok(())
}
