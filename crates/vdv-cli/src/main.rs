use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use vdv_sync::{
    report_markdown, InMemoryStore, IngestConfig, IngestPipeline, PgStore, RunOptions, RunReport,
    RunStatus, SeriesStore, SourceRegistry,
};

#[derive(Debug, Parser)]
#[command(name = "vdv-cli")]
#[command(about = "Daily Vietnamese market-data ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled source once for a date (default command).
    Sync(SyncArgs),
    /// Apply database migrations.
    Migrate,
    /// Re-fetch the global macro series over a wider range.
    BackfillGlobal {
        #[arg(long, default_value = "1y")]
        range: String,
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Fetch past days of the dated bank exchange-rate boards, weekdays only.
    BackfillFx {
        #[arg(long, default_value_t = 365)]
        days: u32,
        /// Last day of the window; defaults to today.
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Rebuild the market analysis for a date from stored rows.
    Analyze {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Print a digest of the latest run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// List the source registry.
    Sources,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Run date, YYYY-MM-DD. Defaults to today in the configured local offset.
    #[arg(long)]
    date: Option<NaiveDate>,
    /// Write to an in-memory store instead of Postgres.
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    skip_analysis: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn local_today(config: &IngestConfig) -> NaiveDate {
    (Utc::now() + ChronoDuration::hours(i64::from(config.utc_offset_hours))).date_naive()
}

async fn open_store(config: &IngestConfig, dry_run: bool) -> Result<Arc<dyn SeriesStore>> {
    if dry_run {
        info!("dry run: writing to the in-memory store");
        return Ok(Arc::new(InMemoryStore::new()));
    }
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is not set (use --dry-run to skip the database)")?;
    let store = PgStore::connect(url).await.context("connecting to Postgres")?;
    Ok(Arc::new(store))
}

async fn build_pipeline(config: &IngestConfig, dry_run: bool) -> Result<IngestPipeline> {
    let registry = SourceRegistry::load(&config.sources_file).await?;
    let store = open_store(config, dry_run).await?;
    IngestPipeline::new(config.clone(), registry, store)
}

fn print_run(report: &RunReport) {
    println!(
        "run {} for {}: status={:?} sources={} written={} skipped={} unset={} broadcast_warnings={}",
        report.run_id,
        report.run_date,
        report.status,
        report.totals.sources_attempted,
        report.totals.rows_written,
        report.totals.rows_skipped,
        report.totals.fields_unset,
        report.totals.broadcast_warnings
    );
    if let Some(analysis) = &report.analysis {
        println!("analysis: {analysis:?}");
    }
}

fn ensure_not_failed(report: &RunReport) -> Result<()> {
    if report.status == RunStatus::Failed {
        bail!("every step of run {} failed", report.run_id);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let config = IngestConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let pipeline = build_pipeline(&config, args.dry_run).await?;
            let date = args.date.unwrap_or_else(|| local_today(&config));
            let report = pipeline
                .run_once(
                    date,
                    RunOptions {
                        skip_analysis: args.skip_analysis,
                    },
                )
                .await?;
            print_run(&report);
            ensure_not_failed(&report)?;
        }
        Commands::Migrate => {
            let url = config.database_url.as_deref().context("DATABASE_URL is not set")?;
            let store = PgStore::connect(url).await.context("connecting to Postgres")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::BackfillGlobal {
            range,
            date,
            dry_run,
        } => {
            let pipeline = build_pipeline(&config, dry_run).await?;
            let date = date.unwrap_or_else(|| local_today(&config));
            let report = pipeline.run_global_backfill(date, &range).await?;
            print_run(&report);
            ensure_not_failed(&report)?;
        }
        Commands::BackfillFx {
            days,
            date,
            dry_run,
        } => {
            let pipeline = build_pipeline(&config, dry_run).await?;
            let until = date.unwrap_or_else(|| local_today(&config));
            let report = pipeline.run_exchange_rate_backfill(until, days).await?;
            print_run(&report);
            ensure_not_failed(&report)?;
        }
        Commands::Analyze { date } => {
            let pipeline = build_pipeline(&config, false).await?;
            let date = date.unwrap_or_else(|| local_today(&config));
            let report = pipeline.trigger().run(date).await;
            println!("analysis for {date}: {report:?}");
        }
        Commands::Report { runs } => {
            println!("{}", report_markdown(runs, &config.reports_dir)?);
        }
        Commands::Sources => {
            let registry = SourceRegistry::load(&config.sources_file).await?;
            for source in &registry.sources {
                println!(
                    "{:<20} {:<8} {:<12} {:<18} {:?} {}",
                    source.source_id,
                    if source.enabled { "enabled" } else { "disabled" },
                    format!("{:?}", source.shape),
                    format!("{:?}", source.step),
                    source.code.as_deref().unwrap_or("-"),
                    source.display_name
                );
            }
        }
    }

    Ok(())
}
