use anyhow::{bail, Result};
use brfss_ingest::{
    config::{Overrides, Settings},
    fetch::{CsvFileSource, RecordSource, SocrataClient},
    history::RunHistory,
    load::BigQueryWarehouse,
    pipeline,
    validate::{validate_frame, Rules},
};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Pull CDC BRFSS survey data and load it into BigQuery.
#[derive(Parser, Debug)]
#[command(name = "brfss-ingest", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract, validate, stage and load
    Run(RunArgs),
    /// Extract and validate only
    Validate(ValidateArgs),
    /// List recorded runs
    History(HistoryArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    overrides: Overrides,

    /// Read a downloaded CSV export instead of calling the API
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Stop after writing the local staging file
    #[arg(long)]
    no_load: bool,
}

#[derive(Args, Debug)]
struct ValidateArgs {
    #[command(flatten)]
    overrides: Overrides,

    /// Validate a downloaded CSV export instead of calling the API
    #[arg(long)]
    csv: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct HistoryArgs {
    #[command(flatten)]
    overrides: Overrides,

    /// Show only the most recent N runs
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[tokio::main]
async fn main() {
    // ─── init logging ────────────────────────────────────────────────
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    if let Err(e) = dispatch(cli).await {
        error!("pipeline failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Validate(args) => validate(args).await,
        Command::History(args) => history(args),
    }
}

fn open_source(settings: &Settings, csv: Option<&Path>) -> Result<Box<dyn RecordSource>> {
    Ok(match csv {
        Some(path) => Box::new(CsvFileSource::open(path)?),
        None => Box::new(SocrataClient::new(settings)?),
    })
}

async fn run(args: RunArgs) -> Result<()> {
    let settings = Settings::resolve(&args.overrides)?;
    let source = open_source(&settings, args.csv.as_deref())?;

    let warehouse = match (&settings.staging_bucket, args.no_load) {
        (_, true) => {
            info!("--no-load given, extract will only be staged locally");
            None
        }
        (None, false) => {
            warn!("no staging bucket configured, extract will only be staged locally");
            None
        }
        (Some(bucket), false) => Some(BigQueryWarehouse::connect(&settings, bucket).await?),
    };

    let summary = pipeline::run(&settings, source.as_ref(), warehouse.as_ref()).await?;

    println!("run:      {}", summary.run_id);
    println!("rows:     {} ({} columns)", summary.rows, summary.columns);
    println!("staged:   {}", summary.staged.path.display());
    if let Some(load) = &summary.load {
        let rows = load
            .rows_loaded
            .map(|n| n.to_string())
            .unwrap_or_else(|| "?".to_string());
        println!("table:    {} ({} rows, job {})", load.table, rows, load.job_id);
    }
    for w in &summary.validation.warnings {
        println!("warning:  {}", w);
    }
    println!("duration: {:.2}s", summary.duration.as_secs_f64());
    Ok(())
}

async fn validate(args: ValidateArgs) -> Result<()> {
    let settings = Settings::resolve(&args.overrides)?;
    let source = open_source(&settings, args.csv.as_deref())?;

    let frame = pipeline::extract(&settings, source.as_ref()).await?;
    let report = validate_frame(&frame, &Rules::from(&settings));

    println!("{:<32} {:>10} {:>8}", "column", "null_count", "null_%");
    for s in &report.null_report {
        println!("{:<32} {:>10} {:>8.2}", s.column, s.null_count, s.null_percentage);
    }
    for w in &report.warnings {
        println!("warning: {}", w);
    }

    if !report.passed {
        let reasons: Vec<String> = report.errors.iter().map(|e| e.to_string()).collect();
        bail!("validation failed: {}", reasons.join("; "));
    }
    println!("validation passed: {} rows, {} columns", frame.num_rows(), frame.num_columns());
    Ok(())
}

fn history(args: HistoryArgs) -> Result<()> {
    let settings = Settings::resolve(&args.overrides)?;
    let runs = RunHistory::new_runs(&settings.history_dir)?.runs()?;
    if runs.is_empty() {
        println!("no runs recorded in {}", settings.history_dir.display());
        return Ok(());
    }

    let skip = runs.len().saturating_sub(args.limit);
    for r in &runs[skip..] {
        println!(
            "{}  {:<26} {:<23} rows={:<8} {:>7.2}s  {}",
            r.started.format("%Y-%m-%d %H:%M:%S"),
            r.run_id,
            r.status(),
            r.rows,
            r.duration_secs(),
            r.destination.as_deref().unwrap_or(&r.source)
        );
        if let Some(err) = &r.error {
            println!("    {}", err);
        }
    }
    Ok(())
}
