// src/load/bigquery.rs

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use google_cloud_bigquery::client::google_cloud_auth::credentials::CredentialsFile as BqCredentials;
use google_cloud_bigquery::client::{Client as BqClient, ClientConfig as BqConfig};
use google_cloud_bigquery::http::dataset::Dataset;
use google_cloud_bigquery::http::job::get::GetJobRequest;
use google_cloud_bigquery::http::job::{
    Job, JobConfiguration, JobConfigurationLoad, JobReference, JobState, JobType,
    WriteDisposition,
};
use google_cloud_bigquery::http::table::{SourceFormat, TableReference};
use google_cloud_storage::client::google_cloud_auth::credentials::CredentialsFile as GcsCredentials;
use google_cloud_storage::client::{Client as GcsClient, ClientConfig as GcsConfig};
use google_cloud_storage::http::objects::upload::{Media, UploadObjectRequest, UploadType};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{LoadSummary, TableTarget, Warehouse};
use crate::{config::Settings, stage::StagedFile};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const JOB_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// BigQuery target. Staged Parquet goes to GCS first, then a load job pulls it in.
pub struct BigQueryWarehouse {
    bq: BqClient,
    gcs: GcsClient,
    project_id: String,
    bucket: String,
    prefix: String,
}

impl BigQueryWarehouse {
    /// Authenticate with the configured service-account key, or application default credentials.
    pub async fn connect(settings: &Settings, bucket: &str) -> Result<Self> {
        let ((bq_cfg, cred_project), gcs_cfg) = match &settings.credentials_path {
            Some(path) => {
                let path_str = path.to_string_lossy().to_string();
                info!(key = %path.display(), "authenticating with service account key");
                let bq_cred = BqCredentials::new_from_file(path_str.clone())
                    .await
                    .with_context(|| format!("reading service account key {}", path.display()))?;
                let gcs_cred = GcsCredentials::new_from_file(path_str)
                    .await
                    .with_context(|| format!("reading service account key {}", path.display()))?;
                (
                    BqConfig::new_with_credentials(bq_cred)
                        .await
                        .context("authenticating BigQuery client")?,
                    GcsConfig::default()
                        .with_credentials(gcs_cred)
                        .await
                        .context("authenticating GCS client")?,
                )
            }
            None => {
                info!("authenticating with application default credentials");
                (
                    BqConfig::new_with_auth()
                        .await
                        .context("authenticating BigQuery client")?,
                    GcsConfig::default()
                        .with_auth()
                        .await
                        .context("authenticating GCS client")?,
                )
            }
        };

        let project_id = settings
            .project_id
            .clone()
            .or(cred_project)
            .ok_or_else(|| anyhow!("no project_id configured and none found in credentials"))?;

        let bq = BqClient::new(bq_cfg)
            .await
            .context("creating BigQuery client")?;
        let gcs = GcsClient::new(gcs_cfg);

        Ok(Self {
            bq,
            gcs,
            project_id,
            bucket: bucket.to_string(),
            prefix: settings.staging_prefix.trim_matches('/').to_string(),
        })
    }

    fn object_name(&self, staged: &StagedFile, target: &TableTarget) -> String {
        staging_object_name(&self.prefix, &target.table_id, &staged.file_name())
    }

    #[instrument(level = "debug", skip(self, staged), fields(file = %staged.path.display()))]
    async fn upload(&self, staged: &StagedFile, object: &str) -> Result<String> {
        let bytes = tokio::fs::read(&staged.path)
            .await
            .with_context(|| format!("reading {}", staged.path.display()))?;

        let mut media = Media::new(object.to_string());
        media.content_length = Some(bytes.len() as u64);
        let req = UploadObjectRequest {
            bucket: self.bucket.clone(),
            ..Default::default()
        };

        self.gcs
            .upload_object(&req, bytes, &UploadType::Simple(media))
            .await
            .with_context(|| format!("uploading gs://{}/{}", self.bucket, object))?;

        let uri = format!("gs://{}/{}", self.bucket, object);
        info!(%uri, bytes = staged.bytes, "uploaded staging file");
        Ok(uri)
    }

    async fn wait_for(&self, mut job: Job, location: &str) -> Result<Job> {
        let job_id = job.job_reference.job_id.clone();
        let started = Instant::now();
        let req = GetJobRequest {
            location: Some(location.to_string()),
        };
        while job.status.state != JobState::Done {
            if started.elapsed() > JOB_TIMEOUT {
                bail!("load job {} still running after {:?}", job_id, JOB_TIMEOUT);
            }
            sleep(POLL_INTERVAL).await;
            job = self
                .bq
                .job()
                .get(&self.project_id, &job_id, &req)
                .await
                .with_context(|| format!("polling load job {}", job_id))?;
            debug!(%job_id, state = ?job.status.state, "load job state");
        }

        if let Some(err) = &job.status.error_result {
            bail!(
                "load job {} failed: {:?} (errors: {:?})",
                job_id,
                err,
                job.status.errors
            );
        }
        Ok(job)
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    fn project_id(&self) -> &str {
        &self.project_id
    }

    async fn ensure_dataset(&self, target: &TableTarget) -> Result<()> {
        let dataset_ref = format!("{}.{}", target.project_id, target.dataset_id);
        match self
            .bq
            .dataset()
            .get(&target.project_id, &target.dataset_id)
            .await
        {
            Ok(_) => {
                info!(dataset = %dataset_ref, "dataset already exists");
                Ok(())
            }
            Err(e) => {
                debug!(dataset = %dataset_ref, error = %e, "dataset lookup failed, creating");
                let mut ds = Dataset::default();
                ds.dataset_reference.project_id = target.project_id.clone();
                ds.dataset_reference.dataset_id = target.dataset_id.clone();
                ds.location = target.location.clone();
                self.bq
                    .dataset()
                    .create(&ds)
                    .await
                    .with_context(|| format!("creating dataset {}", dataset_ref))?;
                info!(dataset = %dataset_ref, location = %target.location, "created dataset");
                Ok(())
            }
        }
    }

    #[instrument(skip(self, staged), fields(table = %target))]
    async fn load_parquet(&self, staged: &StagedFile, target: &TableTarget) -> Result<LoadSummary> {
        let object = self.object_name(staged, target);
        let uri = self.upload(staged, &object).await?;

        let job_id = format!("brfss_load_{}", Uuid::new_v4().simple());
        let job = Job {
            job_reference: JobReference {
                project_id: self.project_id.clone(),
                job_id: job_id.clone(),
                location: Some(target.location.clone()),
            },
            configuration: JobConfiguration {
                job: JobType::Load(JobConfigurationLoad {
                    source_uris: vec![uri],
                    destination_table: TableReference {
                        project_id: target.project_id.clone(),
                        dataset_id: target.dataset_id.clone(),
                        table_id: target.table_id.clone(),
                    },
                    source_format: Some(SourceFormat::Parquet),
                    write_disposition: Some(WriteDisposition::WriteTruncate),
                    autodetect: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        info!(rows = staged.rows, %job_id, "starting load job");
        let created = self
            .bq
            .job()
            .create(&job)
            .await
            .with_context(|| format!("creating load job for {}", target))?;
        self.wait_for(created, &target.location).await?;

        let rows_loaded = match self
            .bq
            .table()
            .get(&target.project_id, &target.dataset_id, &target.table_id)
            .await
        {
            Ok(table) => Some(table.num_rows),
            Err(e) => {
                warn!(error = %e, "could not read back destination table");
                None
            }
        };

        info!(table = %target, rows_loaded = ?rows_loaded, "load job finished");
        Ok(LoadSummary {
            table: target.qualified(),
            rows_loaded,
            job_id,
        })
    }
}

/// `<prefix>/<table>/<file>`, without a leading slash when the prefix is empty.
pub fn staging_object_name(prefix: &str, table: &str, file: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}/{}", table, file)
    } else {
        format!("{}/{}/{}", prefix, table, file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_names() {
        assert_eq!(
            staging_object_name("brfss", "raw_cdc_brfss", "raw_cdc_brfss---1.parquet"),
            "brfss/raw_cdc_brfss/raw_cdc_brfss---1.parquet"
        );
        assert_eq!(
            staging_object_name("/a/b/", "t", "f.parquet"),
            "a/b/t/f.parquet"
        );
        assert_eq!(staging_object_name("", "t", "f.parquet"), "t/f.parquet");
    }
}
