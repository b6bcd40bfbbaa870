//! Loader CLI - runs one batch file through the warehouse pipeline
//!
//! Modes:
//! - default: load into Postgres inside one transaction
//! - `--dry-run`: full pipeline against an in-memory warehouse, nothing persisted
//! - `--validate-only`: profile the batch and report rejections, no sink at all

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use loader::config::Config;
use loader::report::{report_all, CsvRejections, LogRejections, RejectionSink};
use loader::run::{execute, RunOptions, RunOutcome, RunSummary};
use loader::sink::{MemoryWarehouse, PgWarehouse, Warehouse};
use loader::source::{open_source, RecordSource};
use loader::validate::{profile, QualityProfile};

#[derive(Parser, Debug)]
#[command(name = "loader", about = "Loads retail transaction batches into the sales warehouse")]
struct Args {
    /// Batch file (.csv, .xlsx, .xls, .ods). Defaults to INPUT_PATH/sample_transactions.csv
    #[arg(long)]
    source: Option<PathBuf>,

    /// Only load rows dated on this day (YYYY-MM-DD)
    #[arg(long)]
    date: Option<NaiveDate>,

    /// Validate and profile the batch without loading it
    #[arg(long, default_value = "false")]
    validate_only: bool,

    /// Run the whole pipeline against an in-memory warehouse
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Also write rejected rows to this CSV file
    #[arg(long)]
    rejections: Option<PathBuf>,

    /// Create the warehouse tables before loading
    #[arg(long, default_value = "false")]
    init_schema: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("loader=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false) {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let args = Args::parse();
    let config = Config::from_env().context("Invalid configuration")?;

    let path = args.source.clone().unwrap_or_else(|| config.default_source());

    println!("=== Retail Warehouse Loader ===");
    println!("Source: {}", path.display());
    if let Some(day) = args.date {
        println!("Run date: {}", day);
    }
    let mode = if args.validate_only {
        "validate-only"
    } else if args.dry_run {
        "dry-run"
    } else {
        "live"
    };
    println!("Mode: {}", mode);

    let mut source = open_source(&path)?;

    if args.validate_only {
        let records = source.read_records().await?;
        let report = profile(&records);
        let mut reporter = reporter(&args)?;
        report_all(reporter.as_mut(), &report.rejections);
        print_profile(&report);
        return Ok(());
    }

    let options = RunOptions {
        run_date: args.date,
        batch_size: config.batch_size,
    };

    let summary = if args.dry_run {
        let mut sink = MemoryWarehouse::new();
        let summary = run(source.as_mut(), &mut sink, &args, &options).await?;
        let tables = sink.tables();
        println!(
            "\nDry run - in-memory warehouse holds {} facts and {} daily aggregates",
            tables.facts.len(),
            tables.daily_sales.len()
        );
        summary
    } else {
        let mut sink = PgWarehouse::connect(&config).await?;
        if args.init_schema {
            sink.ensure_schema().await?;
        }
        run(source.as_mut(), &mut sink, &args, &options).await?
    };

    print_summary(&summary);

    if summary.outcome == RunOutcome::RolledBack {
        std::process::exit(1);
    }
    Ok(())
}

fn reporter(args: &Args) -> Result<Box<dyn RejectionSink>> {
    Ok(match &args.rejections {
        Some(path) => Box::new(CsvRejections::create(path)?),
        None => Box::new(LogRejections),
    })
}

async fn run<W: Warehouse>(
    source: &mut dyn RecordSource,
    sink: &mut W,
    args: &Args,
    options: &RunOptions,
) -> Result<RunSummary> {
    let mut reporter = reporter(args)?;
    let ctx = execute(source, sink, reporter.as_mut(), options).await;
    Ok(ctx.summary)
}

fn print_profile(report: &QualityProfile) {
    println!("\n=== Data Quality Profile ===");
    println!("Total records: {}", report.total_records);
    println!("Columns: {}", report.columns.join(", "));
    println!("Duplicate records: {}", report.duplicate_records);
    println!("Missing values:");
    for (name, count) in &report.missing_values {
        println!("  {:<16} {}", name, count);
    }
    println!("Data types:");
    for (name, types) in &report.data_types {
        let seen: Vec<String> = types.iter().map(|(t, n)| format!("{} {}", t, n)).collect();
        println!("  {:<16} {}", name, seen.join(", "));
    }
    println!("Accepted: {}", report.accepted);
    println!("Rejected: {}", report.rejected());
    for (kind, count) in &report.rejected_by_kind {
        println!("  {:<20} {}", kind.as_str(), count);
    }
}

fn print_summary(summary: &RunSummary) {
    println!("\n=== Run Summary ===");
    println!("Run ID: {}", summary.run_id);
    println!("Outcome: {}", summary.outcome.as_str());
    println!("Duration: {} ms", summary.duration_ms);
    println!("Rows read: {}", summary.total_rows);
    println!("Accepted: {}", summary.accepted);
    if summary.run_date.is_some() {
        println!("  outside run date: {}", summary.outside_run_date);
    }
    println!("Rejected: {}", summary.rejected());
    for (kind, count) in &summary.rejected_by_kind {
        println!("  {:<20} {}", kind.as_str(), count);
    }
    if summary.duplicates_collapsed > 0 || summary.superseded_in_batch > 0 {
        println!(
            "In-batch duplicates collapsed: {}, superseded: {}",
            summary.duplicates_collapsed, summary.superseded_in_batch
        );
    }
    for (kind, counts) in &summary.dimensions {
        println!(
            "{:<10} inserted {} | updated {} | unchanged {}",
            kind.to_string(), counts.inserted, counts.updated, counts.unchanged
        );
    }
    println!(
        "{:<10} inserted {} | updated {} | unchanged {}",
        "facts", summary.facts.inserted, summary.facts.updated, summary.facts.unchanged
    );
    println!("Daily aggregates refreshed: {}", summary.aggregate_keys_refreshed);
    if let Some(err) = &summary.first_error {
        println!("Error: {}", err);
    }
}
