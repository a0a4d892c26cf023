// src/fetch/mod.rs

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::info;

pub mod csv_file;
pub mod socrata;

pub use csv_file::CsvFileSource;
pub use socrata::SocrataClient;

/// One row as returned by the API: column name → JSON value.
pub type Record = Map<String, Value>;

/// Anything that can hand out survey records a page at a time.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Fetch up to `limit` records starting at `offset`. An empty page means no more data.
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Vec<Record>>;

    /// Human-readable origin, used in logs and the run history.
    fn describe(&self) -> String;
}

/// Pull every available record from `source`, `page_size` at a time.
///
/// Stops on an empty page, on a short page, or once `max_records` have been
/// collected (the result is truncated to exactly that many).
pub async fn fetch_all<S>(
    source: &S,
    page_size: usize,
    max_records: Option<usize>,
) -> Result<Vec<Record>>
where
    S: RecordSource + ?Sized,
{
    let mut all = Vec::new();
    let mut offset = 0;

    if max_records == Some(0) {
        info!("max_records is 0, nothing to fetch");
        return Ok(all);
    }

    info!(source = %source.describe(), page_size, "starting extraction");

    loop {
        let page = source.fetch_page(offset, page_size).await?;
        let fetched = page.len();
        info!(offset, fetched, "fetched page");

        if page.is_empty() {
            break;
        }

        all.extend(page);

        if let Some(max) = max_records {
            if all.len() >= max {
                all.truncate(max);
                info!(max_records = max, "reached max_records limit");
                break;
            }
        }

        if fetched < page_size {
            break;
        }

        offset += page_size;
    }

    info!(total = all.len(), "extraction finished");
    Ok(all)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// In-memory source that records the offsets it was asked for.
    pub(crate) struct VecSource {
        pub records: Vec<Record>,
        pub calls: Mutex<Vec<(usize, usize)>>,
    }

    impl VecSource {
        pub(crate) fn new(n: usize) -> Self {
            let records = (0..n)
                .map(|i| {
                    json!({ "year": "2020", "locationabbr": "CA", "data_value": i.to_string() })
                        .as_object()
                        .cloned()
                        .unwrap()
                })
                .collect();
            Self {
                records,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RecordSource for VecSource {
        async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Vec<Record>> {
            self.calls.lock().unwrap().push((offset, limit));
            let start = offset.min(self.records.len());
            let end = (offset + limit).min(self.records.len());
            Ok(self.records[start..end].to_vec())
        }

        fn describe(&self) -> String {
            "memory".to_string()
        }
    }

    #[tokio::test]
    async fn stops_on_short_page() {
        let src = VecSource::new(25);
        let out = fetch_all(&src, 10, None).await.unwrap();
        assert_eq!(out.len(), 25);
        assert_eq!(*src.calls.lock().unwrap(), vec![(0, 10), (10, 10), (20, 10)]);
    }

    #[tokio::test]
    async fn exact_multiple_needs_an_empty_page_to_stop() {
        let src = VecSource::new(20);
        let out = fetch_all(&src, 10, None).await.unwrap();
        assert_eq!(out.len(), 20);
        assert_eq!(src.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn truncates_to_max_records() {
        let src = VecSource::new(100);
        let out = fetch_all(&src, 10, Some(15)).await.unwrap();
        assert_eq!(out.len(), 15);
        assert_eq!(out[14]["data_value"], "14");
        assert_eq!(src.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn zero_max_records_makes_no_request() {
        let src = VecSource::new(50);
        let out = fetch_all(&src, 10, Some(0)).await.unwrap();
        assert!(out.is_empty());
        assert!(src.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_source_yields_nothing() {
        let src = VecSource::new(0);
        let out = fetch_all(&src, 10, None).await.unwrap();
        assert!(out.is_empty());
    }
}
