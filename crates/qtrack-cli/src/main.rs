use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use qtrack_core::{today_utc, DateRange, SourceKind};
use qtrack_storage::PartitionStore;
use qtrack_sync::{recent_range, HttpAdapterFactory, Pipeline, StopSignal, SyncConfig};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "qtrack")]
#[command(about = "Collects USAJobs questionnaire postings into year-partitioned Parquet files")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect an inclusive date range, one day at a time.
    Collect {
        #[arg(long)]
        start_date: NaiveDate,
        #[arg(long)]
        end_date: NaiveDate,
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long, default_value = "historical")]
        source: SourceKind,
    },
    /// Collect recent postings from the search API (needs USAJOBS_API_TOKEN).
    Current {
        #[arg(long)]
        start_date: Option<NaiveDate>,
        #[arg(long)]
        end_date: Option<NaiveDate>,
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Collect whole years concurrently, one worker per year.
    Parallel {
        #[arg(long, num_args = 1.., required = true)]
        years: Vec<i32>,
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long, default_value = "historical")]
        source: SourceKind,
        #[arg(long)]
        max_workers: Option<usize>,
    },
    /// Print the row count of every partition file.
    Partitions {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env().context("loading configuration")?;
    let today = today_utc();

    match cli.command {
        Commands::Collect {
            start_date,
            end_date,
            data_dir,
            source,
        } => {
            let range = DateRange::new(start_date, end_date)?;
            let pipeline = build_pipeline(config.with_data_dir(data_dir))?;
            let summary = pipeline.collect(source, range).await?;
            print!("{}", summary.render());
        }
        Commands::Current {
            start_date,
            end_date,
            data_dir,
        } => {
            let range = current_range(start_date, end_date, today, config.current_lookback_days)?;
            let pipeline = build_pipeline(config.with_data_dir(data_dir))?;
            let summary = pipeline.collect(SourceKind::Current, range).await?;
            print!("{}", summary.render());
        }
        Commands::Parallel {
            years,
            data_dir,
            source,
            max_workers,
        } => {
            let max_workers = max_workers.unwrap_or(config.max_workers);
            let pipeline = build_pipeline(config.with_data_dir(data_dir))?;
            let (report, summary) = pipeline
                .collect_years(source, &years, today, max_workers)
                .await?;
            for outcome in &report.outcomes {
                let ok = outcome.units.iter().filter(|u| u.is_success()).count();
                match &outcome.worker_error {
                    None => println!("{}: {ok}/{} days collected", outcome.year, outcome.units.len()),
                    Some(err) => println!("{}: worker failed: {err}", outcome.year),
                }
            }
            print!("{}", summary.render());
        }
        Commands::Partitions { data_dir } => {
            let config = config.with_data_dir(data_dir);
            let store = PartitionStore::new(config.data_dir.clone());
            let census = store
                .census()
                .await
                .with_context(|| format!("reading partitions in {}", config.data_dir.display()))?;
            if census.rows.is_empty() {
                println!("no partitions in {}", config.data_dir.display());
            }
            for (key, rows) in &census.rows {
                println!("{}: {rows} jobs", key.file_name());
            }
            println!("total: {} jobs", census.total());
        }
    }

    Ok(())
}

fn build_pipeline(config: SyncConfig) -> Result<Pipeline> {
    let factory = HttpAdapterFactory::from_config(&config)?;
    let stop = StopSignal::new();
    let on_signal = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current date");
            on_signal.trigger();
        }
    });
    Ok(Pipeline::new(config, Arc::new(factory), stop))
}

fn current_range(
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    today: NaiveDate,
    lookback_days: u32,
) -> Result<DateRange> {
    Ok(match (start, end) {
        (None, None) => recent_range(today, lookback_days),
        (Some(start), None) => DateRange::new(start, today)?,
        (None, Some(end)) => DateRange::single(end),
        (Some(start), Some(end)) => DateRange::new(start, end)?,
    })
}
