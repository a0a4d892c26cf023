// src/config.rs

use anyhow::{bail, Context, Result};
use clap::Args;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_API_URL: &str = "https://data.cdc.gov/resource/dttw-5yxu.json";

/// Columns the BRFSS extract is expected to carry. Missing ones only warn.
pub const DEFAULT_EXPECTED_COLUMNS: &[&str] = &[
    "year",
    "locationabbr",
    "locationdesc",
    "class",
    "topic",
    "question",
    "data_value",
    "sample_size",
];

static BQ_IDENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_]{1,1024}$").expect("identifier pattern should compile")
});

/// Everything one ingestion run needs. Loaded from YAML, then overridden by flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // extraction
    pub api_url: String,
    pub app_token: Option<String>,
    pub page_size: usize,
    pub max_records: Option<usize>,
    /// Extra SoQL params, e.g. `$where: "topic='Mental Health'"`.
    pub filters: BTreeMap<String, String>,
    pub request_timeout_secs: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,

    // warehouse
    pub project_id: Option<String>,
    pub dataset_id: String,
    pub table_id: String,
    pub location: String,
    pub credentials_path: Option<PathBuf>,
    pub staging_bucket: Option<String>,
    pub staging_prefix: String,

    // local state
    pub output_dir: PathBuf,
    pub history_dir: PathBuf,

    // validation
    pub expected_columns: Vec<String>,
    pub min_row_count: usize,
    pub max_null_percentage: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            app_token: None,
            page_size: 10_000,
            max_records: None,
            filters: BTreeMap::new(),
            request_timeout_secs: 60,
            max_retries: 3,
            retry_delay_ms: 1_000,
            project_id: None,
            dataset_id: "brfss_mental_health".to_string(),
            table_id: "raw_cdc_brfss".to_string(),
            location: "US".to_string(),
            credentials_path: None,
            staging_bucket: None,
            staging_prefix: "brfss".to_string(),
            output_dir: PathBuf::from("staging"),
            history_dir: PathBuf::from("history"),
            expected_columns: DEFAULT_EXPECTED_COLUMNS
                .iter()
                .map(|c| c.to_string())
                .collect(),
            min_row_count: 100,
            max_null_percentage: 50.0,
        }
    }
}

/// Command-line overrides shared by every subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct Overrides {
    /// YAML settings file
    #[arg(long, env = "BRFSS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Socrata resource URL
    #[arg(long, env = "BRFSS_API_URL")]
    pub api_url: Option<String>,

    /// Socrata application token, sent as X-App-Token
    #[arg(long, env = "BRFSS_APP_TOKEN", hide_env_values = true)]
    pub app_token: Option<String>,

    /// Records requested per page
    #[arg(long, env = "BRFSS_PAGE_SIZE")]
    pub page_size: Option<usize>,

    /// Stop after this many records
    #[arg(long, env = "BRFSS_MAX_RECORDS")]
    pub max_records: Option<usize>,

    /// SoQL `$where` clause, e.g. "topic='Mental Health'"
    #[arg(long = "where", env = "BRFSS_WHERE")]
    pub where_clause: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, env = "BRFSS_TIMEOUT_SECS")]
    pub timeout_secs: Option<u64>,

    /// GCP project (defaults to the one in the credentials)
    #[arg(long, env = "BRFSS_PROJECT_ID")]
    pub project_id: Option<String>,

    /// BigQuery dataset, created if missing
    #[arg(long, env = "BRFSS_DATASET_ID")]
    pub dataset_id: Option<String>,

    /// BigQuery table, replaced on every load
    #[arg(long, env = "BRFSS_TABLE_ID")]
    pub table_id: Option<String>,

    /// Service account key file; application default credentials otherwise
    #[arg(long, env = "BRFSS_CREDENTIALS")]
    pub credentials: Option<PathBuf>,

    /// GCS bucket the staging file is uploaded to before the load job
    #[arg(long, env = "BRFSS_STAGING_BUCKET")]
    pub staging_bucket: Option<String>,

    /// Local directory for staged Parquet extracts
    #[arg(long, env = "BRFSS_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Local directory for the run history table
    #[arg(long, env = "BRFSS_HISTORY_DIR")]
    pub history_dir: Option<PathBuf>,

    /// Minimum number of rows an extract must have
    #[arg(long, env = "BRFSS_MIN_ROWS")]
    pub min_rows: Option<usize>,
}

impl Settings {
    /// Parse a YAML settings file. Fields it omits keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading settings {}", path.display()))?;
        let settings: Settings = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing settings {}", path.display()))?;
        Ok(settings)
    }

    /// Build settings from an optional file plus flag overrides, then validate.
    pub fn resolve(overrides: &Overrides) -> Result<Self> {
        let mut settings = match &overrides.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        settings.apply_cli(overrides);
        settings.validate()?;
        Ok(settings)
    }

    pub fn apply_cli(&mut self, o: &Overrides) {
        if let Some(v) = &o.api_url {
            self.api_url = v.clone();
        }
        if let Some(v) = &o.app_token {
            self.app_token = Some(v.clone());
        }
        if let Some(v) = o.page_size {
            self.page_size = v;
        }
        if let Some(v) = o.max_records {
            self.max_records = Some(v);
        }
        if let Some(v) = &o.where_clause {
            self.filters.insert("$where".to_string(), v.clone());
        }
        if let Some(v) = o.timeout_secs {
            self.request_timeout_secs = v;
        }
        if let Some(v) = &o.project_id {
            self.project_id = Some(v.clone());
        }
        if let Some(v) = &o.dataset_id {
            self.dataset_id = v.clone();
        }
        if let Some(v) = &o.table_id {
            self.table_id = v.clone();
        }
        if let Some(v) = &o.credentials {
            self.credentials_path = Some(v.clone());
        }
        if let Some(v) = &o.staging_bucket {
            self.staging_bucket = Some(v.clone());
        }
        if let Some(v) = &o.output_dir {
            self.output_dir = v.clone();
        }
        if let Some(v) = &o.history_dir {
            self.history_dir = v.clone();
        }
        if let Some(v) = o.min_rows {
            self.min_row_count = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            bail!("page_size must be greater than zero");
        }
        if self.max_records == Some(0) {
            bail!("max_records must be greater than zero when set");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be greater than zero");
        }
        if !(0.0..=100.0).contains(&self.max_null_percentage) {
            bail!(
                "max_null_percentage must be within 0..=100, got {}",
                self.max_null_percentage
            );
        }
        for (what, ident) in [("dataset_id", &self.dataset_id), ("table_id", &self.table_id)] {
            if !BQ_IDENT.is_match(ident) {
                bail!("{what} `{ident}` may only contain letters, digits and underscores");
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
