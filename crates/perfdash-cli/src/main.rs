use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use perfdash_adapters::{FixturePageSource, PageSource};
use perfdash_core::MetricOverrides;
use perfdash_storage::{InMemoryPerformanceStore, PerformanceStore, PgPerformanceStore};
use perfdash_sync::{
    gs_engage_source, load_overrides_file, load_window, pipeline_from_config, report_markdown,
    summarize, upstream_config_from_env, DateWindow, SyncConfig, SyncOutcome,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "perfdash-cli")]
#[command(about = "GS Engage performance dashboard command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch upstream, aggregate and upsert today's rows.
    Sync(SyncArgs),
    /// Apply database migrations.
    Migrate,
    /// Run the dashboard and API server.
    Serve,
    /// Print a markdown report for a date window.
    Report(ReportArgs),
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Read recorded prospections.json/leads.json instead of calling the upstream.
    #[arg(long)]
    fixtures: Option<PathBuf>,
    /// JSON metric overrides applied to this run.
    #[arg(long)]
    overrides: Option<PathBuf>,
    /// Fetch and aggregate without writing to the database.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct ReportArgs {
    #[arg(long)]
    start: Option<NaiveDate>,
    #[arg(long)]
    end: Option<NaiveDate>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => run_sync(args).await?,
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            let store = PgPerformanceStore::connect(&config.database_url)
                .await
                .context("connecting to DATABASE_URL")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => perfdash_web::serve_from_env().await?,
        Commands::Report(args) => {
            let config = SyncConfig::from_env()?;
            let store = PgPerformanceStore::connect(&config.database_url)
                .await
                .context("connecting to DATABASE_URL")?;
            let window = DateWindow::resolve(args.start, args.end, Local::now().date_naive());
            let selection = load_window(&store, window, config.pipeline.fallback_limit).await?;
            println!("{}", report_markdown(&summarize(window, &selection)));
        }
    }

    Ok(())
}

async fn run_sync(args: SyncArgs) -> Result<()> {
    let config = if args.dry_run {
        // Nothing is written on a dry run, so the database URL may be absent.
        SyncConfig::from_lookup(|name| {
            std::env::var(name)
                .ok()
                .or_else(|| (name == "DATABASE_URL").then(|| "postgres://unused".to_string()))
        })?
    } else {
        SyncConfig::from_env()?
    };

    let source: Arc<dyn PageSource> = match &args.fixtures {
        Some(dir) => Arc::new(FixturePageSource::from_dir(dir)?),
        None => Arc::new(gs_engage_source(&config, upstream_config_from_env()?)?),
    };
    let store: Arc<dyn PerformanceStore> = if args.dry_run {
        Arc::new(InMemoryPerformanceStore::new())
    } else {
        Arc::new(
            PgPerformanceStore::connect(&config.database_url)
                .await
                .context("connecting to DATABASE_URL")?,
        )
    };
    let run_overrides = match &args.overrides {
        Some(path) => load_overrides_file(path).await?,
        None => MetricOverrides::default(),
    };

    let pipeline = pipeline_from_config(&config, source, store).await?;

    if args.dry_run {
        let preview = pipeline.preview(&run_overrides).await?;
        info!(users = preview.users.len(), "dry run; nothing persisted");
        println!("{}", serde_json::to_string_pretty(&preview)?);
        return Ok(());
    }

    let outcome = pipeline.run_once(&run_overrides).await?;
    let summary = outcome.summary();
    match &outcome {
        SyncOutcome::Synced(_) => println!(
            "sync complete: run_id={} date={} users={} saved={} pages={}",
            summary.run_id,
            summary.sync_date,
            summary.users,
            summary.records_saved,
            summary.diagnostics.pages_fetched
        ),
        SyncOutcome::NoData(_) => println!(
            "sync complete: run_id={} no attributable records (unattributed prospections={})",
            summary.run_id, summary.diagnostics.unattributed_prospections
        ),
    }
    Ok(())
}
