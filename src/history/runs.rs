use anyhow::{anyhow, Result};
use arrow::{
    array::{Array, ArrayRef, BooleanArray, StringArray, TimestampMicrosecondArray, UInt64Array},
    datatypes::{DataType as ArrowDataType, Field, Schema as ArrowSchema, TimeUnit},
    record_batch::RecordBatch,
};
use chrono::{DateTime, NaiveDate, Utc};
use std::{path::PathBuf, sync::Arc};

use crate::history::table_history::{column_as, HistoryRow, TableHistory};

/// One ingestion run, successful or not.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub run_id: String,
    pub source: String,
    pub rows: u64,
    pub columns: u64,
    pub passed: bool,
    /// `project.dataset.table` when the extract was loaded.
    pub destination: Option<String>,
    pub error: Option<String>,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
}

impl RunRecord {
    pub fn duration_secs(&self) -> f64 {
        (self.finished - self.started).num_milliseconds() as f64 / 1000.0
    }

    /// `ok`, `failed` (extraction or validation), or `failed-after-validation`
    /// (staging or load).
    pub fn status(&self) -> &'static str {
        match (&self.error, self.passed) {
            (None, _) => "ok",
            (Some(_), false) => "failed",
            (Some(_), true) => "failed-after-validation",
        }
    }
}

fn ts_field(name: &str) -> Field {
    Field::new(
        name,
        ArrowDataType::Timestamp(TimeUnit::Microsecond, None),
        false,
    )
}

fn to_utc(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| anyhow!("timestamp {} out of range", micros))
}

fn opt_str(arr: &StringArray, row: usize) -> Option<String> {
    (!arr.is_null(row)).then(|| arr.value(row).to_string())
}

impl HistoryRow for RunRecord {
    fn partition_date(&self) -> NaiveDate {
        self.started.date_naive()
    }

    fn schema() -> ArrowSchema {
        ArrowSchema::new(vec![
            Field::new("run_id", ArrowDataType::Utf8, false),
            Field::new("source", ArrowDataType::Utf8, false),
            Field::new("rows", ArrowDataType::UInt64, false),
            Field::new("columns", ArrowDataType::UInt64, false),
            Field::new("passed", ArrowDataType::Boolean, false),
            Field::new("destination", ArrowDataType::Utf8, true),
            Field::new("error", ArrowDataType::Utf8, true),
            ts_field("started"),
            ts_field("finished"),
        ])
    }

    fn to_arrays(&self) -> Vec<ArrayRef> {
        vec![
            Arc::new(StringArray::from(vec![self.run_id.clone()])),
            Arc::new(StringArray::from(vec![self.source.clone()])),
            Arc::new(UInt64Array::from(vec![self.rows])),
            Arc::new(UInt64Array::from(vec![self.columns])),
            Arc::new(BooleanArray::from(vec![self.passed])),
            Arc::new(StringArray::from(vec![self.destination.clone()])),
            Arc::new(StringArray::from(vec![self.error.clone()])),
            Arc::new(TimestampMicrosecondArray::from(vec![self
                .started
                .timestamp_micros()])),
            Arc::new(TimestampMicrosecondArray::from(vec![self
                .finished
                .timestamp_micros()])),
        ]
    }

    fn unique_key(&self) -> String {
        self.run_id.clone()
    }

    fn from_batch(batch: &RecordBatch, row: usize) -> Result<Self> {
        Ok(Self {
            run_id: column_as::<StringArray>(batch, 0)?.value(row).to_string(),
            source: column_as::<StringArray>(batch, 1)?.value(row).to_string(),
            rows: column_as::<UInt64Array>(batch, 2)?.value(row),
            columns: column_as::<UInt64Array>(batch, 3)?.value(row),
            passed: column_as::<BooleanArray>(batch, 4)?.value(row),
            destination: opt_str(column_as::<StringArray>(batch, 5)?, row),
            error: opt_str(column_as::<StringArray>(batch, 6)?, row),
            started: to_utc(column_as::<TimestampMicrosecondArray>(batch, 7)?.value(row))?,
            finished: to_utc(column_as::<TimestampMicrosecondArray>(batch, 8)?.value(row))?,
        })
    }
}

pub type RunHistory = TableHistory<RunRecord>;

impl TableHistory<RunRecord> {
    pub fn new_runs(base: impl Into<PathBuf>) -> Result<Self> {
        TableHistory::new(base, "runs")
    }

    /// All recorded runs, oldest first.
    pub fn runs(&self) -> Result<Vec<RunRecord>> {
        let mut runs = self.read_all()?;
        runs.sort_by(|a, b| a.started.cmp(&b.started).then_with(|| a.run_id.cmp(&b.run_id)));
        Ok(runs)
    }
}
