use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use simcat_storage::{CatalogStore, HttpFetcher, PgCatalogStore};
use simcat_sync::scheduler::build_scheduler;
use simcat_sync::telemetry::init_tracing;
use simcat_sync::{
    CatalogConfig, CatalogService, JobCommand, JobRunner, JobState, Orchestrator, SyncIntent,
};
use simcat_web::AppState;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "simcat")]
#[command(about = "eSIM catalog sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Run the JSON API, plus the scheduled sync when enabled.
    Serve,
    SyncAll,
    SyncCountry {
        country: String,
    },
    /// Deactivate a country's packages, then sync it again.
    UpdateCountry {
        country: String,
    },
    BatchSync {
        #[arg(required = true)]
        countries: Vec<String>,
    },
    BatchUpdate {
        #[arg(required = true)]
        countries: Vec<String>,
    },
    SyncProvider {
        slug: String,
    },
    UpdateProvider {
        slug: String,
    },
    /// Delete inactive packages untouched for `--days`.
    Cleanup {
        #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u32).range(1..))]
        days: u32,
        #[arg(long)]
        dry_run: bool,
    },
    Validate,
    Stats,
    Countries {
        #[arg(long)]
        provider: Option<String>,
    },
}

struct Runtime {
    store: PgCatalogStore,
    service: CatalogService,
    jobs: JobRunner,
}

async fn bootstrap(config: &CatalogConfig) -> Result<Runtime> {
    let store = PgCatalogStore::connect(&config.database_url, 10)
        .await
        .context("connecting to the catalog database")?;
    let http = HttpFetcher::new(config.http_client_config()).context("building http client")?;
    let registry = config.registry();
    if registry.is_empty() {
        warn!("no provider credentials configured; sync commands will fail");
    }

    let shared: Arc<dyn CatalogStore> = Arc::new(store.clone());
    let orchestrator = Orchestrator::new(registry, shared, Arc::new(http));
    let service = CatalogService::new(orchestrator);
    let jobs = JobRunner::new(Arc::new(service.clone()), config.retry_policy())
        .with_retention(config.job_retention());
    Ok(Runtime { store, service, jobs })
}

/// Runs a command through the job runner so it gets the configured retries.
async fn run_job(jobs: &JobRunner, command: JobCommand) -> Result<()> {
    let record = jobs.enqueue(command).await.wait().await?;
    print_json(&record)?;
    if record.state == JobState::Failed {
        bail!(
            "job failed after {} attempt(s): {}",
            record.attempts,
            record.last_error.unwrap_or_default()
        );
    }
    Ok(())
}

async fn run_sync(jobs: &JobRunner, intent: SyncIntent) -> Result<()> {
    run_job(jobs, JobCommand::Sync(intent)).await
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = CatalogConfig::from_env();
    init_tracing(&config.log)?;

    let runtime = bootstrap(&config).await?;

    match cli.command {
        Commands::Migrate => {
            runtime.store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let scheduler = build_scheduler(&config, runtime.jobs.clone()).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
            }
            info!(port = config.web_port, "starting catalog api");
            let state = AppState::new(runtime.service, runtime.jobs);
            simcat_web::serve(state, config.web_port).await?;
        }
        Commands::SyncAll => run_sync(&runtime.jobs, SyncIntent::SyncAll).await?,
        Commands::SyncCountry { country } => {
            run_sync(&runtime.jobs, SyncIntent::SyncCountry { country }).await?
        }
        Commands::UpdateCountry { country } => {
            run_sync(&runtime.jobs, SyncIntent::UpdateCountry { country }).await?
        }
        Commands::BatchSync { countries } => {
            run_sync(&runtime.jobs, SyncIntent::BatchSync { countries }).await?
        }
        Commands::BatchUpdate { countries } => {
            run_sync(&runtime.jobs, SyncIntent::BatchUpdate { countries }).await?
        }
        Commands::SyncProvider { slug } => {
            run_sync(&runtime.jobs, SyncIntent::SyncProvider { provider: slug }).await?
        }
        Commands::UpdateProvider { slug } => {
            run_sync(&runtime.jobs, SyncIntent::UpdateProvider { provider: slug }).await?
        }
        Commands::Cleanup { days, dry_run } => {
            run_job(&runtime.jobs, JobCommand::Cleanup { days, dry_run }).await?
        }
        Commands::Validate => print_json(&runtime.service.validate().await?)?,
        Commands::Stats => print_json(&runtime.service.stats().await?)?,
        Commands::Countries { provider } => {
            print_json(&runtime.service.countries(provider.as_deref()).await?)?
        }
    }

    Ok(())
}
