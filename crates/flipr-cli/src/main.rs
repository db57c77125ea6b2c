use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flipr_storage::{ConnectionResolver, PropertyStore, StorageHandle};
use flipr_sync::{shutdown_channel, CycleRunner, EngineConfig, IngestionOrchestrator};
use flipr_web::AppState;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "flipr")]
#[command(about = "Flipr property ingestion engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a single ingestion cycle and print its summary.
    Sync,
    /// Run scheduled ingestion cycles until interrupted.
    Run {
        /// Also serve the HTTP routes.
        #[arg(long)]
        with_web: bool,
    },
    /// Serve the HTTP routes; schedules cycles too when FLIPR_SCHEDULER_ENABLED is set.
    Serve,
    /// Resolve storage and print its health.
    Health,
    /// Show how the configured connection descriptor is interpreted.
    Resolve {
        /// Also attempt to connect.
        #[arg(long)]
        connect: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => sync_once(&config).await?,
        Commands::Run { with_web } => run_services(&config, true, with_web).await?,
        Commands::Serve => run_services(&config, config.scheduler_enabled, true).await?,
        Commands::Health => {
            let storage = open_storage(&config).await?;
            let counts = storage.status_counts().await;
            let health = storage.health();
            println!("{}", serde_json::to_string_pretty(&health)?);
            match counts {
                Ok(counts) => println!("{}", serde_json::to_string_pretty(&counts)?),
                Err(err) => warn!(error = %err, "could not count properties"),
            }
        }
        Commands::Resolve { connect } => {
            let resolver = ConnectionResolver::new(config.resolver_config());
            match config.database_url.as_deref() {
                Some(raw) => match resolver.describe(raw) {
                    Ok(descriptor) => println!(
                        "descriptor: {descriptor}\nusable: {}",
                        descriptor.is_usable()
                    ),
                    Err(err) => println!("descriptor rejected: {err}"),
                },
                None => println!("DATABASE_URL is not set"),
            }
            println!("fallback allowed: {}", config.allow_fallback);
            if connect {
                let storage = resolver
                    .resolve(config.database_url.as_deref())
                    .await
                    .context("resolving storage")?;
                println!("{}", serde_json::to_string_pretty(&storage.health())?);
            }
        }
    }

    Ok(())
}

async fn open_storage(config: &EngineConfig) -> Result<StorageHandle> {
    let resolver = ConnectionResolver::new(config.resolver_config());
    let storage = resolver
        .resolve(config.database_url.as_deref())
        .await
        .context("resolving storage")?;
    let health = storage.health();
    info!(
        mode = health.storage_mode.as_str(),
        backend = %health.backend,
        "storage resolved"
    );
    Ok(storage)
}

async fn sync_once(config: &EngineConfig) -> Result<()> {
    let storage = open_storage(config).await?;
    let orchestrator = IngestionOrchestrator::from_config(config, storage).await?;
    let (trigger, signal) = shutdown_channel();

    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after in-flight writes");
            trigger.trigger();
        }
    });
    let summary = orchestrator.run_cycle(&signal).await;
    watcher.abort();
    let summary = summary?;

    println!(
        "sync complete: run_id={} new={} updated={} duplicates={} interrupted={}",
        summary.run_id,
        summary.total_new(),
        summary.total_updated(),
        summary.total_duplicates(),
        summary.interrupted
    );
    for provider in &summary.providers {
        if let Some(reason) = &provider.skipped_reason {
            println!("  {} skipped: {}", provider.provider_id, reason);
        }
    }
    Ok(())
}

async fn run_services(config: &EngineConfig, schedule: bool, web: bool) -> Result<()> {
    let storage = open_storage(config).await?;
    let (trigger, signal) = shutdown_channel();

    let web_task = if web {
        let state = AppState::new(storage.clone()).with_default_page_size(config.page_size);
        let mut stop = signal.clone();
        Some(tokio::spawn(flipr_web::serve(state, config.web_port, async move {
            stop.triggered().await;
        })))
    } else {
        None
    };

    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for interrupt");
        }
    };

    if schedule {
        let orchestrator = Arc::new(IngestionOrchestrator::from_config(config, storage).await?);
        let runner = CycleRunner::new(orchestrator, signal);
        let drained = flipr_sync::run_until(
            runner,
            &config.sync_cron,
            &trigger,
            Duration::from_secs(config.shutdown_grace_secs),
            ctrl_c,
        )
        .await?;
        if !drained {
            warn!("in-flight cycles were aborted at shutdown");
        }
    } else {
        ctrl_c.await;
        trigger.trigger();
    }

    if let Some(task) = web_task {
        task.await.context("http task panicked")??;
    }
    info!("shutdown complete");
    Ok(())
}
