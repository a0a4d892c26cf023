use anyhow::{anyhow, Context, Result};
use arrow::{
    array::{Array, ArrayRef},
    datatypes::Schema as ArrowSchema,
    record_batch::RecordBatch,
};
use chrono::{NaiveDate, Utc};
use glob::glob;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use parquet::arrow::ArrowWriter;
use std::{
    collections::HashSet,
    ffi::OsStr,
    fs::{self, File},
    io::BufWriter,
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

/// File each partition is merged into by `vacuum`.
const CONSOLIDATED: &str = "consolidated.parquet";

/// A row in a history table.
/// - Defines schema and to_arrays for writes, from_batch for reads.
/// - `unique_key` dedupes rows and names the file.
pub trait HistoryRow: Sized {
    /// Partition date (UTC naive) for hive partitioning
    fn partition_date(&self) -> NaiveDate;
    /// Arrow schema for this row type
    fn schema() -> ArrowSchema;
    /// Convert this row into single-element column arrays matching the schema
    fn to_arrays(&self) -> Vec<ArrayRef>;
    /// Unique dedupe key for this row
    fn unique_key(&self) -> String;
    /// Rebuild row `row` of a batch written with `schema()`
    fn from_batch(batch: &RecordBatch, row: usize) -> Result<Self>;
}

/// Generic hive-partitioned history table: `<base>/<table>/date=YYYYMMDD/<key>---<ts>.parquet`.
pub struct TableHistory<R: HistoryRow> {
    table_dir: PathBuf,
    schema: Arc<ArrowSchema>,
    seen: Mutex<HashSet<String>>,
    _marker: PhantomData<R>,
}

impl<R: HistoryRow> TableHistory<R> {
    /// Create the table directory and load the keys already on disk.
    pub fn new(base_dir: impl Into<PathBuf>, table: &str) -> Result<Self> {
        let table_dir = base_dir.into().join(table);
        fs::create_dir_all(&table_dir)
            .with_context(|| format!("could not create `{}`", table_dir.display()))?;

        let hist = Self {
            table_dir,
            schema: Arc::new(R::schema()),
            seen: Mutex::new(HashSet::new()),
            _marker: PhantomData,
        };
        let keys: HashSet<String> = hist.read_all()?.iter().map(R::unique_key).collect();
        *hist.lock_seen() = keys;
        Ok(hist)
    }

    /// Add a row. Returns false if a row with the same key was already recorded.
    pub fn add(&self, row: &R) -> Result<bool> {
        let key = row.unique_key();
        if !self.lock_seen().insert(key.clone()) {
            return Ok(false);
        }

        let partition = format!("date={}", row.partition_date().format("%Y%m%d"));
        let dir = self.table_dir.join(partition);
        fs::create_dir_all(&dir)?;

        let ts = Utc::now().timestamp_micros();
        let fname = format!("{}---{}.parquet", key, ts);
        let tmp = dir.join(format!("{}.tmp", fname));
        let final_path = dir.join(&fname);

        let file = File::create(&tmp).with_context(|| format!("creating `{}`", tmp.display()))?;
        let mut writer = ArrowWriter::try_new(BufWriter::new(file), self.schema.clone(), None)?;
        let batch = RecordBatch::try_new(self.schema.clone(), row.to_arrays())
            .context("building history record batch")?;
        writer.write(&batch)?;
        writer.close()?;
        fs::rename(&tmp, &final_path)?;
        Ok(true)
    }

    /// Check if a row exists by its dedupe key
    pub fn contains(&self, key: &str) -> bool {
        self.lock_seen().contains(key)
    }

    /// Every row in every partition, in no particular order.
    pub fn read_all(&self) -> Result<Vec<R>> {
        let mut rows = Vec::new();
        let pattern = format!("{}/*/*.parquet", self.table_dir.display());
        for entry in glob(&pattern)? {
            for batch in open_reader(&entry?)? {
                let batch = batch?;
                for i in 0..batch.num_rows() {
                    rows.push(R::from_batch(&batch, i)?);
                }
            }
        }
        Ok(rows)
    }

    /// Merge every partition holding more than one file into a single
    /// `consolidated.parquet`, so opening the table stays a few reads.
    /// Returns how many files were merged.
    pub fn vacuum(&self) -> Result<usize> {
        let mut merged = 0;
        let parts = fs::read_dir(&self.table_dir)
            .with_context(|| format!("listing `{}`", self.table_dir.display()))?;
        for part in parts {
            let dir = part?.path();
            if !dir.is_dir() {
                continue;
            }
            let files: Vec<PathBuf> = glob(&format!("{}/*.parquet", dir.display()))?
                .filter_map(Result::ok)
                .collect();
            if files.len() < 2 {
                continue;
            }

            let tmp = dir.join(format!("{}.tmp", CONSOLIDATED));
            let file = File::create(&tmp).with_context(|| format!("creating `{}`", tmp.display()))?;
            let mut writer = ArrowWriter::try_new(BufWriter::new(file), self.schema.clone(), None)?;
            for path in &files {
                for batch in open_reader(path)? {
                    writer.write(&batch?)?;
                }
            }
            writer.close()?;
            fs::rename(&tmp, dir.join(CONSOLIDATED))?;

            for path in &files {
                if path.file_name() != Some(OsStr::new(CONSOLIDATED)) {
                    fs::remove_file(path)
                        .with_context(|| format!("removing merged `{}`", path.display()))?;
                }
            }
            merged += files.len();
        }
        Ok(merged)
    }

    fn lock_seen(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        // A poisoned set is still a valid set of keys.
        self.seen.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn open_reader(path: &Path) -> Result<ParquetRecordBatchReader> {
    let file = File::open(path).with_context(|| format!("failed to open `{}`", path.display()))?;
    ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading `{}`", path.display()))?
        .with_batch_size(1024)
        .build()
        .with_context(|| format!("reading `{}`", path.display()))
}

/// Downcast column `idx` of `batch` to a concrete array type.
pub(crate) fn column_as<T: Array + 'static>(batch: &RecordBatch, idx: usize) -> Result<&T> {
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| {
            anyhow!(
                "history column `{}` has unexpected type {}",
                batch.schema().field(idx).name(),
                batch.column(idx).data_type()
            )
        })
}
