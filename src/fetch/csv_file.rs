// src/fetch/csv_file.rs

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use csv::ReaderBuilder;
use serde_json::Value;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use tracing::info;

use super::{Record, RecordSource};

/// A manually downloaded BRFSS CSV export, served through the same paging interface as the API.
#[derive(Debug)]
pub struct CsvFileSource {
    path: PathBuf,
    records: Vec<Record>,
}

impl CsvFileSource {
    /// Read the whole export. Headers are normalised to the API's column names
    /// (`LocationAbbr` → `locationabbr`, `Data_Value` → `data_value`); blank cells become nulls.
    ///
    /// Two headers that normalise to the same name are an error, as is a row
    /// with non-blank cells past the last header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut rdr = ReaderBuilder::new()
            .flexible(true)
            .from_path(&path)
            .with_context(|| format!("opening CSV {}", path.display()))?;

        let headers: Vec<String> = rdr
            .headers()
            .with_context(|| format!("reading header of {}", path.display()))?
            .iter()
            .map(normalize_header)
            .collect();

        let mut first_at: HashMap<&str, usize> = HashMap::new();
        for (i, name) in headers.iter().enumerate() {
            if name.is_empty() {
                continue;
            }
            if let Some(prev) = first_at.insert(name.as_str(), i) {
                bail!(
                    "{}: columns {} and {} both normalise to `{}`",
                    path.display(),
                    prev + 1,
                    i + 1,
                    name
                );
            }
        }

        let mut records = Vec::new();
        for (line, row) in rdr.records().enumerate() {
            let row = row.with_context(|| format!("reading {} row {}", path.display(), line + 1))?;
            if row.iter().skip(headers.len()).any(|c| !c.trim().is_empty()) {
                bail!(
                    "{} row {} has {} cells but the header names {} columns",
                    path.display(),
                    line + 1,
                    row.len(),
                    headers.len()
                );
            }
            let mut rec = Record::new();
            for (name, cell) in headers.iter().zip(row.iter()) {
                if name.is_empty() {
                    continue;
                }
                let value = if cell.trim().is_empty() {
                    Value::Null
                } else {
                    Value::String(cell.to_string())
                };
                rec.insert(name.clone(), value);
            }
            records.push(rec);
        }

        info!(
            file = %path.display(),
            rows = records.len(),
            columns = headers.len(),
            "loaded CSV export"
        );
        Ok(Self { path, records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl RecordSource for CsvFileSource {
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Vec<Record>> {
        let start = offset.min(self.records.len());
        let end = offset.saturating_add(limit).min(self.records.len());
        Ok(self.records[start..end].to_vec())
    }

    fn describe(&self) -> String {
        format!("file://{}", self.path.display())
    }
}

/// Lowercase, collapse every run of non-alphanumerics into one `_`, trim `_` at the ends.
pub fn normalize_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for c in raw.trim_start_matches('\u{feff}').chars() {
        if c.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(c.to_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::fetch_all;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn header_normalisation() {
        assert_eq!(normalize_header("LocationAbbr"), "locationabbr");
        assert_eq!(normalize_header("Data_Value"), "data_value");
        assert_eq!(normalize_header("\u{feff}YearStart"), "yearstart");
        assert_eq!(normalize_header(" Sample Size (n) "), "sample_size_n");
        assert_eq!(normalize_header("Break_Out__Category"), "break_out_category");
    }

    #[tokio::test]
    async fn reads_export_and_pages_it() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "Year,LocationAbbr,Topic,Data_Value,Sample_Size").unwrap();
        writeln!(f, "2020,CA,Depression,18.2,1200").unwrap();
        writeln!(f, "2020,NY,Depression,,950").unwrap();
        writeln!(f, "2021,TX,\"Mental Health, Days\",4.1,800").unwrap();

        let src = CsvFileSource::open(f.path()).unwrap();
        assert_eq!(src.len(), 3);

        let all = fetch_all(&src, 2, None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0]["locationabbr"], "CA");
        assert_eq!(all[1]["data_value"], Value::Null);
        assert_eq!(all[2]["topic"], "Mental Health, Days");
        assert!(src.describe().starts_with("file://"));
    }

    #[tokio::test]
    async fn short_rows_leave_columns_absent() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "year,topic,data_value").unwrap();
        writeln!(f, "2019,Stress").unwrap();

        let src = CsvFileSource::open(f.path()).unwrap();
        let page = src.fetch_page(0, 10).await.unwrap();
        assert_eq!(page.len(), 1);
        assert!(!page[0].contains_key("data_value"));
        assert!(src.fetch_page(5, 10).await.unwrap().is_empty());
    }

    #[test]
    fn colliding_headers_are_rejected() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "Year,Data_Value,Data Value").unwrap();
        writeln!(f, "2020,18.2,19.0").unwrap();

        let err = CsvFileSource::open(f.path()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("columns 2 and 3"), "{msg}");
        assert!(msg.contains("`data_value`"), "{msg}");
    }

    #[tokio::test]
    async fn trailing_blank_cells_are_ignored() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "year,topic").unwrap();
        writeln!(f, "2019,Stress,").unwrap();

        let src = CsvFileSource::open(f.path()).unwrap();
        let page = src.fetch_page(0, 10).await.unwrap();
        assert_eq!(page[0].len(), 2);
        assert_eq!(page[0]["topic"], "Stress");
    }

    #[test]
    fn overlong_rows_are_rejected() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "year,topic,data_value").unwrap();
        writeln!(f, "2019,Stress,12.1").unwrap();
        writeln!(f, "2020,Mental Health, Days,14.0").unwrap();

        let err = CsvFileSource::open(f.path()).unwrap_err();
        assert!(err.to_string().contains("row 2 has 4 cells"), "{}", err);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(CsvFileSource::open("/definitely/not/here.csv").is_err());
    }
}
