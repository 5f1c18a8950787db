use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use verdi_core::plus_one_day;
use verdi_storage::{FsStore, ImageStore, TimeSeriesStore};
use verdi_sync::{
    build_orchestrator, delete_geometry, load_area_registry, maybe_start_refresher, SyncConfig,
    SyncScheduler,
};

#[derive(Debug, Parser)]
#[command(name = "verdi")]
#[command(about = "VERDI command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Bring every enabled area in the registry up to date over a window.
    Sync {
        /// Area registry file; defaults to VERDI_AREAS_FILE.
        #[arg(long)]
        areas: Option<PathBuf>,
        /// First observation day, inclusive.
        #[arg(long)]
        from: NaiveDate,
        /// Last observation day, inclusive.
        #[arg(long)]
        to: NaiveDate,
    },
    /// Run the cron-driven refresher until interrupted.
    Refresh,
    /// List the stored series.
    Status,
    /// Remove one named area's series and its rasters.
    Delete {
        /// Area registry file; defaults to VERDI_AREAS_FILE.
        #[arg(long)]
        areas: Option<PathBuf>,
        name: String,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn day_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    let store = Arc::new(FsStore::new(config.data_dir.clone()));
    let series: Arc<dyn TimeSeriesStore> = store.clone();
    let images: Arc<dyn ImageStore> = store.clone();

    match cli.command {
        Commands::Sync { areas, from, to } => {
            let path = areas.unwrap_or_else(|| config.areas_file.clone());
            let registry = load_area_registry(&path).await?;
            let batch = registry.batch(day_start(from), plus_one_day(day_start(to)));
            if batch.areas.is_empty() {
                bail!("no enabled areas in {}", path.display());
            }
            let orchestrator = build_orchestrator(&config, series, images)?;
            let summary = orchestrator.run_batch(batch).await;
            println!(
                "batch {}: {} created, {} extended, {} skipped, {} failed, {} rasters saved, {} deferred",
                summary.batch_id,
                summary.created,
                summary.extended,
                summary.skipped,
                summary.failed,
                summary.images_saved,
                summary.images_deferred
            );
        }
        Commands::Refresh => {
            let orchestrator = build_orchestrator(&config, series.clone(), images)?;
            let scheduler = SyncScheduler::spawn(orchestrator);
            let Some(_jobs) = maybe_start_refresher(&config, scheduler.clone(), series).await?
            else {
                bail!("set VERDI_SCHEDULER_ENABLED=1 to run the refresher");
            };
            println!(
                "refresher running on `{}`; ctrl-c to stop",
                config.refresh_cron
            );
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            scheduler.wait_until_idle().await;
        }
        Commands::Status => {
            let mut records = series.list_series().await?;
            if records.is_empty() {
                println!("no stored series under {}", config.data_dir.display());
                return Ok(());
            }
            records.sort_by(|a, b| a.id.cmp(&b.id));
            for record in records {
                let newest = record
                    .newest_date()
                    .map(|at| at.to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{}  dates={}  newest={}  area_m2={:.0}",
                    record.id,
                    record.dates.len(),
                    newest,
                    record.area
                );
            }
        }
        Commands::Delete { areas, name } => {
            let path = areas.unwrap_or_else(|| config.areas_file.clone());
            let registry = load_area_registry(&path).await?;
            let area = registry
                .areas
                .iter()
                .find(|area| area.name == name)
                .with_context(|| format!("area `{name}` is not in {}", path.display()))?;
            if delete_geometry(series.as_ref(), images.as_ref(), &area.geometry).await? {
                println!("removed series and rasters for `{name}`");
            } else {
                println!("no stored series for `{name}`");
            }
        }
    }

    Ok(())
}
