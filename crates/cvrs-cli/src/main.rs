use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cvrs_core::{RuntimeConfig, SourceRegistry};
use cvrs_monitor::{AnalyticsAggregator, MonitorConfig, MonitoringService};
use cvrs_storage::{ClaimService, MemoryVendorStore, PgVendorStore, VendorStore};
use cvrs_sync::{maybe_build_scheduler, SourceManager};
use cvrs_web::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cvrs-cli")]
#[command(about = "Canadian Vendor Registry Sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one full ingestion pass over all enabled sources.
    Sync,
    /// Serve the JSON API with the monitor ticker and scheduler.
    Serve,
    /// List the configured sources.
    Sources,
}

struct Services {
    config: RuntimeConfig,
    registry: SourceRegistry,
    state: AppState,
}

async fn bootstrap() -> Result<Services> {
    let config = RuntimeConfig::from_env();
    let registry = SourceRegistry::load(&config.sources_path)
        .with_context(|| format!("loading {}", config.sources_path.display()))?;

    let store: Arc<dyn VendorStore> = match &config.database_url {
        Some(url) => Arc::new(
            PgVendorStore::connect(url)
                .await
                .context("connecting to DATABASE_URL")?,
        ),
        None => {
            info!("DATABASE_URL not set, using in-memory vendor store");
            Arc::new(MemoryVendorStore::new())
        }
    };

    let monitor = MonitoringService::new(MonitorConfig::default());
    let manager = Arc::new(SourceManager::new(
        config.clone(),
        store.clone(),
        monitor.clone(),
    )?);
    let analytics = Arc::new(AnalyticsAggregator::new(monitor.clone(), &registry.sources));
    let claims = Arc::new(ClaimService::new(store.clone()));

    Ok(Services {
        config,
        state: AppState {
            registry: registry.clone(),
            manager,
            monitor,
            analytics,
            store,
            claims,
        },
        registry,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let services = bootstrap().await?;
            let sources = services.registry.enabled();
            let job = services.state.manager.run_job(sources).await;
            println!(
                "sync complete: job={} state={:?} processed={} saved={}",
                job.id,
                job.state,
                job.records_processed(),
                job.records_saved()
            );
            for result in &job.results {
                println!(
                    "  {}: success={} processed={} saved={} attempts={} errors={}",
                    result.source,
                    result.success,
                    result.records_processed,
                    result.records_saved,
                    result.attempts,
                    result.errors.len()
                );
            }
        }
        Commands::Serve => {
            let services = bootstrap().await?;
            services.state.monitor.spawn_ticker();
            if let Some(scheduler) = maybe_build_scheduler(
                services.state.manager.clone(),
                &services.registry,
                &services.config,
            )
            .await?
            {
                scheduler.start().await.context("starting scheduler")?;
            }
            info!(port = services.config.web_port, "serving JSON API");
            cvrs_web::serve(services.state, services.config.web_port).await?;
        }
        Commands::Sources => {
            let services = bootstrap().await?;
            for source in &services.registry.sources {
                println!(
                    "{}\t{:?}\tenabled={}\trate_limit={}\t{}",
                    source.name,
                    source.source_type,
                    source.enabled,
                    source
                        .rate_limit
                        .map(|l| l.to_string())
                        .unwrap_or_else(|| "default".to_string()),
                    source.url
                );
            }
        }
    }

    Ok(())
}
