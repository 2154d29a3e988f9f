use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use jobscout_core::{Cadence, ScheduleConfig, SearchParams, TriggerType};
use jobscout_engine::{
    next_trigger, CatalogResolver, EngineConfig, RegistryResolver, RunController, Scheduler,
    SourceCatalog, SourceResolver,
};
use jobscout_storage::{MemoryStore, Persistence, PgStore};
use jobscout_web::AppState;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "jobscout-cli")]
#[command(about = "Job discovery run orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute one discovery run and print the outcome.
    Run {
        #[arg(long, default_value = "local")]
        user: String,
        /// Source ids to fan out to; defaults to the enabled catalog.
        #[arg(long = "source")]
        sources: Vec<String>,
        #[arg(long)]
        query: Option<String>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Serve the JSON API, with the cron scheduler when enabled.
    Serve {
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
    /// Create or update the recurring schedule for a user.
    Schedule {
        #[arg(long, default_value = "local")]
        user: String,
        #[arg(long, value_enum, default_value_t = CadenceArg::Daily)]
        cadence: CadenceArg,
        /// Time of day as HH:MM in the given offset.
        #[arg(long, default_value = "09:00")]
        time: String,
        #[arg(long, default_value_t = 0)]
        utc_offset_minutes: i32,
        #[arg(long = "source")]
        sources: Vec<String>,
    },
    /// Apply database migrations.
    Migrate,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CadenceArg {
    Daily,
    TwiceDaily,
    Weekly,
}

impl From<CadenceArg> for Cadence {
    fn from(value: CadenceArg) -> Self {
        match value {
            CadenceArg::Daily => Cadence::Daily,
            CadenceArg::TwiceDaily => Cadence::TwiceDaily,
            CadenceArg::Weekly => Cadence::Weekly,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve { port: 8000 }) {
        Commands::Run {
            user,
            sources,
            query,
            location,
            limit,
        } => {
            let store = build_store(&config).await?;
            let controller = Arc::new(RunController::new(
                store,
                build_resolver(&config).await,
                config,
            )?);

            let source_ids = if sources.is_empty() { None } else { Some(sources) };
            let params = SearchParams {
                query,
                location,
                limit,
            };
            let run = controller
                .create_run(&user, source_ids, params, TriggerType::Manual, None)
                .await?;
            controller.execute(run.id).await?;

            let run = controller
                .store()
                .get_run(run.id)
                .await?
                .context("run disappeared after execution")?;
            println!(
                "run {} finished: status={:?} sources={}/{} found={} new={} duplicates={} errors={}",
                run.id,
                run.status,
                run.progress.completed_sources,
                run.progress.total_sources,
                run.stats.total_jobs,
                run.stats.new_jobs,
                run.stats.duplicate_jobs,
                run.errors.len(),
            );
            for entry in &run.errors {
                println!("  error [{}]: {}", entry.source_id, entry.error);
            }
        }
        Commands::Serve { port } => {
            let store = build_store(&config).await?;
            let controller = Arc::new(RunController::new(
                store,
                build_resolver(&config).await,
                config.clone(),
            )?);

            let scheduler = Arc::new(Scheduler::new(
                Arc::clone(&controller),
                config.run_retention_days,
            ));
            let cron = scheduler.maybe_build_cron(&config).await?;
            if let Some(cron) = &cron {
                cron.start().await.context("starting cron scheduler")?;
                info!("cron scheduler running");
            }

            jobscout_web::serve(AppState::new(controller), port).await?;
        }
        Commands::Schedule {
            user,
            cadence,
            time,
            utc_offset_minutes,
            sources,
        } => {
            let store = build_store(&config).await?;
            let existing = store.get_schedule(&user).await?;
            let mut schedule = ScheduleConfig {
                id: existing.as_ref().map(|s| s.id).unwrap_or_else(Uuid::new_v4),
                user_id: user.clone(),
                enabled: true,
                cadence: cadence.into(),
                time_of_day: time,
                utc_offset_minutes,
                source_ids: sources,
                last_run_at: existing.as_ref().and_then(|s| s.last_run_at),
                next_run_at: None,
                last_run_id: existing.as_ref().and_then(|s| s.last_run_id),
            };
            schedule.next_run_at = next_trigger(&schedule, Utc::now());
            anyhow::ensure!(
                schedule.next_run_at.is_some(),
                "invalid time of day {:?} or offset {}",
                schedule.time_of_day,
                schedule.utc_offset_minutes
            );
            store.put_schedule(&schedule).await?;
            println!(
                "schedule for {} saved: cadence={:?} next_run_at={:?}",
                user, schedule.cadence, schedule.next_run_at
            );
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}

/// Postgres when DATABASE_URL is configured, in-memory otherwise.
async fn build_store(config: &EngineConfig) -> Result<Arc<dyn Persistence>> {
    if std::env::var("DATABASE_URL").is_ok() {
        let store = PgStore::connect(&config.database_url)
            .await
            .context("connecting to database")?;
        store.migrate().await.context("running migrations")?;
        Ok(Arc::new(store))
    } else {
        warn!("DATABASE_URL not set, using in-memory store");
        Ok(Arc::new(MemoryStore::new()))
    }
}

/// Catalog-restricted resolver when sources.yaml is present, the full
/// registry otherwise.
async fn build_resolver(config: &EngineConfig) -> Box<dyn SourceResolver> {
    match SourceCatalog::load(&config.workspace_root).await {
        Ok(catalog) => Box::new(CatalogResolver::new(&catalog)),
        Err(err) => {
            warn!(error = %err, "no usable sources.yaml, using built-in registry");
            Box::new(RegistryResolver)
        }
    }
}
