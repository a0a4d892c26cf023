// src/stage.rs

use anyhow::{Context, Result};
use arrow::{
    array::{ArrayRef, Float64Array, StringArray},
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use chrono::Utc;
use parquet::{arrow::ArrowWriter, basic::Compression, file::properties::WriterProperties};
use rayon::prelude::*;
use std::{
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::info;

use crate::frame::Frame;

/// A Parquet extract written to local disk.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedFile {
    pub path: PathBuf,
    pub rows: usize,
    pub bytes: u64,
}

impl StagedFile {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Float64 only if the value survives a trip through `f64` unchanged, otherwise Utf8.
pub fn infer_dtype(s: &str) -> DataType {
    if is_lossless_number(s) {
        DataType::Float64
    } else {
        DataType::Utf8
    }
}

/// Plain decimal (`-12`, `18.20`) whose `f64` value prints back as the same number.
///
/// Zero-padded codes (`01`), surrounding whitespace, exponents, `NaN`/`inf` and
/// integers beyond 2^53 are rejected so staging never rewrites a source value.
pub fn is_lossless_number(s: &str) -> bool {
    let unsigned = s.strip_prefix('-').unwrap_or(s);
    let (int, frac) = match unsigned.split_once('.') {
        Some((int, frac)) => (int, Some(frac)),
        None => (unsigned, None),
    };
    let digits = |p: &str| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit());
    if !digits(int) || frac.is_some_and(|f| !digits(f)) {
        return false;
    }
    if int.len() > 1 && int.starts_with('0') {
        return false;
    }

    let Ok(value) = s.parse::<f64>() else {
        return false;
    };
    // Trailing fractional zeros carry no value; everything else must come back verbatim.
    let canonical = match frac {
        Some(_) => s.trim_end_matches('0').trim_end_matches('.'),
        None => s,
    };
    value.to_string() == canonical
}

/// A column is numeric only if every non-null value is; all-null columns stay Utf8.
pub fn infer_schema(frame: &Frame) -> Schema {
    let fields: Vec<Field> = (0..frame.num_columns())
        .into_par_iter()
        .map(|i| {
            let mut values = frame.column_at(i).flatten().peekable();
            let numeric = values.peek().is_some()
                && values.all(|v| infer_dtype(v) == DataType::Float64);
            let ty = if numeric {
                DataType::Float64
            } else {
                DataType::Utf8
            };
            Field::new(&frame.columns()[i], ty, true)
        })
        .collect();
    Schema::new(fields)
}

pub fn to_record_batch(frame: &Frame, schema: Arc<Schema>) -> Result<RecordBatch> {
    let arrays: Vec<ArrayRef> = schema
        .fields()
        .iter()
        .enumerate()
        .map(|(i, field)| -> ArrayRef {
            match field.data_type() {
                DataType::Float64 => Arc::new(Float64Array::from_iter(
                    frame
                        .column_at(i)
                        .map(|v| v.and_then(|s| s.parse::<f64>().ok())),
                )),
                _ => Arc::new(StringArray::from_iter(frame.column_at(i))),
            }
        })
        .collect();

    RecordBatch::try_new(schema, arrays).context("building extract record batch")
}

/// Write `frame` to `<dir>/<table>/date=YYYYMMDD/<table>---<micros>.parquet`.
pub fn write_parquet(frame: &Frame, dir: impl AsRef<Path>, table: &str) -> Result<StagedFile> {
    let now = Utc::now();
    let part_dir = dir
        .as_ref()
        .join(table)
        .join(format!("date={}", now.format("%Y%m%d")));
    fs::create_dir_all(&part_dir)
        .with_context(|| format!("creating staging directory {}", part_dir.display()))?;

    let schema = Arc::new(infer_schema(frame));
    let batch = to_record_batch(frame, schema.clone())?;

    let fname = format!("{}---{}.parquet", table, now.timestamp_micros());
    let final_path = part_dir.join(&fname);
    let tmp = part_dir.join(format!("{}.tmp", fname));

    let file = File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(BufWriter::new(file), schema, Some(props))
        .context("creating parquet writer")?;
    writer.write(&batch).context("writing extract batch")?;
    writer.close().context("closing parquet writer")?;
    fs::rename(&tmp, &final_path)
        .with_context(|| format!("renaming {} -> {}", tmp.display(), final_path.display()))?;

    let bytes = fs::metadata(&final_path)?.len();
    info!(
        path = %final_path.display(),
        rows = frame.num_rows(),
        bytes,
        "staged extract"
    );

    Ok(StagedFile {
        path: final_path,
        rows: frame.num_rows(),
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Array;
    use glob::glob;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use tempfile::tempdir;

    fn sample() -> Frame {
        Frame::from_rows(
            vec![
                "year".into(),
                "locationabbr".into(),
                "data_value".into(),
                "footnote".into(),
            ],
            vec![
                vec![
                    Some("2020".into()),
                    Some("CA".into()),
                    Some("18.2".into()),
                    None,
                ],
                vec![Some("2021".into()), Some("NY".into()), None, None],
                vec![
                    Some("2021".into()),
                    Some("TX".into()),
                    Some("4".into()),
                    None,
                ],
            ],
        )
    }

    #[test]
    fn infers_numeric_and_text_columns() {
        let schema = infer_schema(&sample());
        let types: Vec<&DataType> = schema.fields().iter().map(|f| f.data_type()).collect();
        assert_eq!(
            types,
            vec![
                &DataType::Float64,
                &DataType::Utf8,
                &DataType::Float64,
                &DataType::Utf8
            ]
        );
        assert!(schema.fields().iter().all(|f| f.is_nullable()));
    }

    #[test]
    fn one_text_value_makes_the_column_text() {
        let f = Frame::from_rows(
            vec!["sample_size".into()],
            vec![vec![Some("120".into())], vec![Some("~".into())]],
        );
        assert_eq!(infer_schema(&f).field(0).data_type(), &DataType::Utf8);
    }

    #[test]
    fn zero_padded_codes_stay_text() {
        let f = Frame::from_rows(
            vec!["locationid".into(), "data_value".into()],
            vec![
                vec![Some("01".into()), Some("18.20".into())],
                vec![Some("0059".into()), Some("-3.5".into())],
                vec![Some("12".into()), Some("0.25".into())],
            ],
        );
        let schema = infer_schema(&f);
        assert_eq!(schema.field(0).data_type(), &DataType::Utf8);
        assert_eq!(schema.field(1).data_type(), &DataType::Float64);

        let batch = to_record_batch(&f, Arc::new(schema)).unwrap();
        let ids = batch
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(ids.value(0), "01");
        assert_eq!(ids.value(1), "0059");
    }

    #[test]
    fn lossy_numbers_are_text() {
        for v in [
            "NaN",
            "inf",
            "-infinity",
            "1e3",
            "+5",
            " 4 ",
            ".5",
            "7.",
            "9007199254740993",
            "0x1F",
        ] {
            assert_eq!(infer_dtype(v), DataType::Utf8, "{v}");
        }
        for v in ["0", "0.5", "-0", "2020", "100.0", "9007199254740992", "18.25"] {
            assert_eq!(infer_dtype(v), DataType::Float64, "{v}");
        }
    }

    #[test]
    fn batch_keeps_nulls() {
        let f = sample();
        let batch = to_record_batch(&f, Arc::new(infer_schema(&f))).unwrap();
        assert_eq!(batch.num_rows(), 3);
        let dv = batch
            .column(2)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(dv.value(0), 18.2);
        assert!(dv.is_null(1));
        assert_eq!(dv.value(2), 4.0);
    }

    #[test]
    fn writes_partitioned_parquet() {
        let tmp = tempdir().unwrap();
        let staged = write_parquet(&sample(), tmp.path(), "raw_cdc_brfss").unwrap();

        assert_eq!(staged.rows, 3);
        assert!(staged.bytes > 0);
        assert!(staged.file_name().starts_with("raw_cdc_brfss---"));

        let pattern = format!("{}/raw_cdc_brfss/date=*/*.parquet", tmp.path().display());
        let files: Vec<_> = glob(&pattern).unwrap().filter_map(Result::ok).collect();
        assert_eq!(files, vec![staged.path.clone()]);
        let leftovers = glob(&format!("{}/**/*.tmp", tmp.path().display()))
            .unwrap()
            .count();
        assert_eq!(leftovers, 0);

        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(&staged.path).unwrap())
            .unwrap()
            .build()
            .unwrap();
        let total: usize = reader.map(|b| b.unwrap().num_rows()).sum();
        assert_eq!(total, 3);
    }
}
