// src/pipeline.rs

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    config::Settings,
    fetch::{fetch_all, RecordSource},
    frame::Frame,
    history::{RunHistory, RunRecord},
    load::{LoadSummary, TableTarget, Warehouse},
    stage::{write_parquet, StagedFile},
    validate::{validate_frame, Rules, ValidationReport},
};

/// What a completed run produced.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub source: String,
    pub rows: usize,
    pub columns: usize,
    pub validation: ValidationReport,
    pub staged: StagedFile,
    pub load: Option<LoadSummary>,
    pub duration: Duration,
}

/// Step 1: pull every record from `source` into a frame.
#[instrument(skip_all, fields(source = %source.describe()))]
pub async fn extract<S>(settings: &Settings, source: &S) -> Result<Frame>
where
    S: RecordSource + ?Sized,
{
    let records = fetch_all(source, settings.page_size, settings.max_records)
        .await
        .context("extracting records")?;
    if records.is_empty() {
        bail!("no data fetched from {}", source.describe());
    }

    let frame = Frame::from_records(&records);
    let (rows, columns) = frame.shape();
    info!(rows, columns, names = ?frame.columns(), "built frame");
    Ok(frame)
}

/// Step 2: hold the frame to the configured rules.
#[instrument(skip_all)]
pub fn check(settings: &Settings, frame: &Frame) -> Result<ValidationReport> {
    let report = validate_frame(frame, &Rules::from(settings));
    if !report.passed {
        let reasons: Vec<String> = report.errors.iter().map(|e| e.to_string()).collect();
        bail!("data validation failed: {}", reasons.join("; "));
    }
    Ok(report)
}

/// Step 4: create the dataset if needed and load the staged file.
#[instrument(skip_all, fields(table = %target))]
pub async fn load<W>(warehouse: &W, staged: &StagedFile, target: &TableTarget) -> Result<LoadSummary>
where
    W: Warehouse + ?Sized,
{
    warehouse.ensure_dataset(target).await?;
    warehouse.load_parquet(staged, target).await
}

/// Extract → validate → stage → (optionally) load, recording the run in history either way.
pub async fn run<S, W>(settings: &Settings, source: &S, warehouse: Option<&W>) -> Result<RunSummary>
where
    S: RecordSource + ?Sized,
    W: Warehouse + ?Sized,
{
    let clock = Instant::now();
    let started = Utc::now();
    let run_id = format!(
        "{}-{}",
        started.format("%Y%m%dT%H%M%S"),
        &Uuid::new_v4().simple().to_string()[..8]
    );
    // History is bookkeeping: an unreadable ledger is logged, never fatal.
    let history = match RunHistory::new_runs(&settings.history_dir) {
        Ok(h) => Some(h),
        Err(e) => {
            warn!(error = ?e, "run history unavailable, this run will not be recorded");
            None
        }
    };

    info!(%run_id, "BRFSS ingestion started");

    let mut record = RunRecord {
        run_id: run_id.clone(),
        source: source.describe(),
        rows: 0,
        columns: 0,
        passed: false,
        destination: None,
        error: None,
        started,
        finished: started,
    };

    let result = execute(settings, source, warehouse, &mut record).await;

    record.finished = Utc::now();
    if let Err(e) = &result {
        record.error = Some(format!("{:#}", e));
    }
    if let Some(history) = &history {
        record_run(history, &record);
    }

    let (validation, staged, loaded) = result?;
    let summary = RunSummary {
        run_id,
        source: record.source,
        rows: record.rows as usize,
        columns: record.columns as usize,
        validation,
        staged,
        load: loaded,
        duration: clock.elapsed(),
    };

    info!(
        run_id = %summary.run_id,
        rows = summary.rows,
        staged = %summary.staged.path.display(),
        table = summary.load.as_ref().map(|l| l.table.as_str()).unwrap_or("<not loaded>"),
        duration_secs = summary.duration.as_secs_f64(),
        "pipeline completed successfully"
    );
    Ok(summary)
}

fn record_run(history: &RunHistory, record: &RunRecord) {
    if let Err(e) = history.add(record) {
        warn!(error = ?e, "could not record run history");
        return;
    }
    match history.vacuum() {
        Ok(0) => {}
        Ok(merged) => debug!(merged, "consolidated run history"),
        Err(e) => warn!(error = ?e, "could not consolidate run history"),
    }
}

async fn execute<S, W>(
    settings: &Settings,
    source: &S,
    warehouse: Option<&W>,
    record: &mut RunRecord,
) -> Result<(ValidationReport, StagedFile, Option<LoadSummary>)>
where
    S: RecordSource + ?Sized,
    W: Warehouse + ?Sized,
{
    info!("step 1: extracting data");
    let frame = extract(settings, source).await?;
    record.rows = frame.num_rows() as u64;
    record.columns = frame.num_columns() as u64;

    info!("step 2: validating data");
    let validation = check(settings, &frame)?;
    record.passed = true;

    info!("step 3: staging extract");
    let staged = write_parquet(&frame, &settings.output_dir, &settings.table_id)?;

    let loaded = match warehouse {
        Some(wh) => {
            info!("step 4: loading to warehouse");
            let target = TableTarget::new(wh.project_id(), settings);
            let summary = load(wh, &staged, &target).await?;
            record.destination = Some(summary.table.clone());
            Some(summary)
        }
        None => {
            info!("no warehouse configured, skipping load");
            None
        }
    };

    Ok((validation, staged, loaded))
}
