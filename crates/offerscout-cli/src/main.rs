use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use offerscout_core::SourceConfig;
use offerscout_storage::{HttpFetcher, PgRecordStore, RecordStore};
use offerscout_sync::{EngineConfig, RunOrchestrator};
use offerscout_web::AppState;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "offerscout")]
#[command(about = "Offer Scout extraction engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Operator API, plus the cron scheduler when enabled.
    Serve,
    /// Run one source now and wait for it to finish.
    Run {
        #[arg(long)]
        source: String,
    },
    /// Dry-run a source config file (YAML or JSON) against a live page.
    Test {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        url: Option<String>,
    },
    Migrate,
    ImportSources {
        #[arg(long, default_value = "sources.yaml")]
        file: PathBuf,
    },
    /// Scheduler only, until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let shutdown = CancellationToken::new();
            let orchestrator = orchestrator(&config, shutdown.clone()).await?;
            let scheduler =
                offerscout_sync::maybe_build_scheduler(&config, orchestrator.clone()).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.sync_cron, "scheduler started");
            }
            let served = offerscout_web::serve(AppState::new(orchestrator), config.web_port).await;
            shutdown.cancel();
            served?;
        }
        Commands::Run { source } => {
            let orchestrator = orchestrator(&config, CancellationToken::new()).await?;
            let handle = match orchestrator.start_run(&source).await {
                Ok(handle) => handle,
                Err(rejected) => bail!("run for `{source}` rejected: {}", rejected.reason()),
            };
            let run = handle.wait().await?;
            println!(
                "run complete: run_id={} source={} status={} deals={}",
                run.run_id, run.source_id, run.status, run.deals_found
            );
            for error in &run.errors {
                println!("  {error}");
            }
        }
        Commands::Test { config: path, url } => {
            let text = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let source: SourceConfig =
                serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
            let url = url.unwrap_or_else(|| source.url.clone());
            let fetcher = HttpFetcher::new(config.http_client_config())?;
            let today = Utc::now().date_naive();
            let report = offerscout_sync::test_config(&fetcher, &url, &source, today).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.success {
                bail!("no usable candidates from {url}");
            }
        }
        Commands::Migrate => {
            connect(&config).await?;
            println!("migrations applied");
        }
        Commands::ImportSources { file } => {
            let store = connect(&config).await?;
            let count = offerscout_sync::import_sources(&store, &file).await?;
            println!("imported {count} sources from {}", file.display());
        }
        Commands::Schedule => {
            let shutdown = CancellationToken::new();
            let orchestrator = orchestrator(&config, shutdown.clone()).await?;
            let scheduler = offerscout_sync::maybe_build_scheduler(&config, orchestrator).await?;
            let Some(mut sched) = scheduler else {
                bail!("scheduler disabled; set OFFERSCOUT_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            shutdown.cancel();
            if let Err(err) = sched.shutdown().await {
                warn!(error = %err, "scheduler shutdown failed");
            }
        }
    }

    Ok(())
}

async fn connect(config: &EngineConfig) -> Result<PgRecordStore> {
    let store = PgRecordStore::connect(&config.database_url)
        .await
        .context("connecting to postgres")?;
    store.migrate().await?;
    Ok(store)
}

async fn orchestrator(
    config: &EngineConfig,
    shutdown: CancellationToken,
) -> Result<RunOrchestrator> {
    let store: Arc<dyn RecordStore> = Arc::new(connect(config).await?);
    Ok(config.build_orchestrator(store)?.with_shutdown(shutdown))
}
