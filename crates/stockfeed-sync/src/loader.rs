//! Bulk loaders: stage the encoded payload and replace the destination table.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use stockfeed_core::{EncodedPayload, OutputFormat};
use stockfeed_storage::{
    compress_gzip, CloudWarehouse, LoadJobRequest, ObjectStore, StagingStore, TableRef,
    WriteDisposition,
};
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub raw_bytes: usize,
    pub compressed_bytes: usize,
    pub local_path: Option<String>,
    pub uploaded_uri: Option<String>,
    pub load_job_id: Option<String>,
}

/// Loads one run's payload into its destination.
#[async_trait]
pub trait BulkLoader: Send + Sync {
    async fn load(&self, store: &str, payload: &EncodedPayload) -> Result<LoadReport>;
}

/// Where the compressed payload goes and which table it replaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudTarget {
    pub project_id: String,
    pub bucket: String,
    pub blob: String,
    pub table: TableRef,
}

/// gzip -> optional local copy -> object storage upload -> truncating load job.
pub struct GcsBigQueryLoader {
    objects: Arc<dyn ObjectStore>,
    warehouse: Arc<dyn CloudWarehouse>,
    target: CloudTarget,
    staging: Option<StagingStore>,
}

impl GcsBigQueryLoader {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        warehouse: Arc<dyn CloudWarehouse>,
        target: CloudTarget,
    ) -> Self {
        Self {
            objects,
            warehouse,
            target,
            staging: None,
        }
    }

    pub fn with_local_copy(mut self, staging: StagingStore) -> Self {
        self.staging = Some(staging);
        self
    }
}

#[async_trait]
impl BulkLoader for GcsBigQueryLoader {
    async fn load(&self, store: &str, payload: &EncodedPayload) -> Result<LoadReport> {
        let extension = payload.format.extension();
        let (compressed, local_path) = match &self.staging {
            Some(staging) => {
                let staged = staging
                    .stage(Utc::now(), store, extension, &payload.bytes)
                    .await
                    .context("staging local copy of payload")?;
                (staged.compressed, Some(staged.absolute_path.display().to_string()))
            }
            None => (
                compress_gzip(&payload.bytes).context("gzip-compressing payload")?,
                None,
            ),
        };

        let uri = self
            .objects
            .upload(
                &self.target.bucket,
                &self.target.blob,
                "application/gzip",
                &compressed,
            )
            .await
            .context("uploading payload to object storage")?;

        let job = self
            .warehouse
            .start_load_job(&LoadJobRequest {
                project_id: self.target.project_id.clone(),
                source_uri: uri.clone(),
                destination: self.target.table.clone(),
                source_format: payload.format.load_source_format().to_string(),
                write_disposition: WriteDisposition::Truncate,
                autodetect: true,
                skip_leading_rows: (payload.format == OutputFormat::Csv).then_some(1),
            })
            .await
            .context("starting load job")?;
        self.warehouse
            .wait_for_job(&job)
            .await
            .with_context(|| format!("waiting for load job {}", job.job_id))?;

        info!(
            store,
            table = %self.target.table,
            records = payload.records,
            job_id = %job.job_id,
            "table replaced"
        );
        Ok(LoadReport {
            raw_bytes: payload.bytes.len(),
            compressed_bytes: compressed.len(),
            local_path,
            uploaded_uri: Some(uri),
            load_job_id: Some(job.job_id),
        })
    }
}

/// Writes the compressed payload to the staging directory and stops there.
pub struct LocalOnlyLoader {
    staging: StagingStore,
}

impl LocalOnlyLoader {
    pub fn new(staging: StagingStore) -> Self {
        Self { staging }
    }
}

#[async_trait]
impl BulkLoader for LocalOnlyLoader {
    async fn load(&self, store: &str, payload: &EncodedPayload) -> Result<LoadReport> {
        let staged = self
            .staging
            .stage(Utc::now(), store, payload.format.extension(), &payload.bytes)
            .await
            .context("staging payload locally")?;
        info!(
            store,
            path = %staged.absolute_path.display(),
            reused = staged.reused,
            "payload staged locally, cloud load skipped"
        );
        Ok(LoadReport {
            raw_bytes: staged.raw_bytes,
            compressed_bytes: staged.compressed.len(),
            local_path: Some(staged.absolute_path.display().to_string()),
            uploaded_uri: None,
            load_job_id: None,
        })
    }
}
