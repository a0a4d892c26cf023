// src/load/mod.rs

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;

use crate::{config::Settings, stage::StagedFile};

pub mod bigquery;

pub use bigquery::BigQueryWarehouse;

/// Fully qualified destination table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableTarget {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
    pub location: String,
}

impl TableTarget {
    pub fn new(project_id: impl Into<String>, settings: &Settings) -> Self {
        Self {
            project_id: project_id.into(),
            dataset_id: settings.dataset_id.clone(),
            table_id: settings.table_id.clone(),
            location: settings.location.clone(),
        }
    }

    /// `project.dataset.table`
    pub fn qualified(&self) -> String {
        format!("{}.{}.{}", self.project_id, self.dataset_id, self.table_id)
    }
}

impl fmt::Display for TableTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadSummary {
    pub table: String,
    pub rows_loaded: Option<u64>,
    pub job_id: String,
}

/// Destination warehouse for staged extracts.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Project the warehouse writes into.
    fn project_id(&self) -> &str;

    /// Make sure the target dataset exists, creating it when it does not.
    async fn ensure_dataset(&self, target: &TableTarget) -> Result<()>;

    /// Replace the target table's contents with the staged file.
    async fn load_parquet(&self, staged: &StagedFile, target: &TableTarget) -> Result<LoadSummary>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_name() {
        let t = TableTarget::new("enduring-broker", &Settings::default());
        assert_eq!(t.qualified(), "enduring-broker.brfss_mental_health.raw_cdc_brfss");
        assert_eq!(t.to_string(), t.qualified());
        assert_eq!(t.location, "US");
    }
}
