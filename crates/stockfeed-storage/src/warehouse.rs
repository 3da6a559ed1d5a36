//! Cloud warehouse (BigQuery) jobs: bulk loads, query jobs and table retention.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use gcp_bigquery_client::error::BQError;
use gcp_bigquery_client::model::job::Job;
use gcp_bigquery_client::model::job_configuration::JobConfiguration;
use gcp_bigquery_client::model::job_configuration_load::JobConfigurationLoad;
use gcp_bigquery_client::model::job_configuration_query::JobConfigurationQuery;
use gcp_bigquery_client::model::job_reference::JobReference;
use gcp_bigquery_client::model::table_reference::TableReference;
use gcp_bigquery_client::yup_oauth2::parse_service_account_key;
use gcp_bigquery_client::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Upper bound on bytes a dashboard query may bill (100 GB).
pub const MAXIMUM_BYTES_BILLED: u64 = 100_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

impl TableRef {
    pub fn new(
        project_id: impl Into<String>,
        dataset_id: impl Into<String>,
        table_id: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            dataset_id: dataset_id.into(),
            table_id: table_id.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project_id, self.dataset_id, self.table_id)
    }
}

/// Query job request in the `jobs.insert` wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryJobBody {
    pub job_reference: JobReferenceBody,
    pub configuration: QueryJobConfiguration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReferenceBody {
    pub project_id: String,
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryJobConfiguration {
    pub query: QueryJobSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryJobSpec {
    pub destination_table: DestinationTable,
    pub maximum_bytes_billed: u64,
    pub query: String,
    pub use_legacy_sql: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationTable {
    pub dataset_id: String,
    pub table_id: String,
    pub project_id: String,
}

impl From<&DestinationTable> for TableRef {
    fn from(table: &DestinationTable) -> Self {
        TableRef::new(&table.project_id, &table.dataset_id, &table.table_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WriteDisposition {
    #[default]
    #[serde(rename = "WRITE_TRUNCATE")]
    Truncate,
    #[serde(rename = "WRITE_APPEND")]
    Append,
    #[serde(rename = "WRITE_EMPTY")]
    Empty,
}

impl WriteDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Truncate => "WRITE_TRUNCATE",
            Self::Append => "WRITE_APPEND",
            Self::Empty => "WRITE_EMPTY",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadJobRequest {
    pub project_id: String,
    pub source_uri: String,
    pub destination: TableRef,
    pub source_format: String,
    pub write_disposition: WriteDisposition,
    pub autodetect: bool,
    /// Header lines to skip; set for CSV payloads.
    pub skip_leading_rows: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub project_id: String,
    pub job_id: String,
    pub location: Option<String>,
}

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("bigquery client error: {0}")]
    Client(#[from] BQError),
    #[error("reading service account key: {0}")]
    Io(#[from] std::io::Error),
    #[error("job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },
    #[error("bigquery did not return a job reference")]
    MissingJobReference,
}

/// Jobs the feed and the dashboard worker need from the cloud warehouse.
#[async_trait]
pub trait CloudWarehouse: Send + Sync {
    async fn start_query_job(&self, body: &QueryJobBody) -> Result<JobHandle, WarehouseError>;

    async fn start_load_job(&self, request: &LoadJobRequest) -> Result<JobHandle, WarehouseError>;

    /// Resolves once the job reaches a terminal state; a failed job is an error.
    async fn wait_for_job(&self, job: &JobHandle) -> Result<(), WarehouseError>;

    /// Returns `false` when the table did not exist.
    async fn delete_table(&self, table: &TableRef) -> Result<bool, WarehouseError>;
}

pub struct BigQueryWarehouse {
    client: Client,
    poll_interval: Duration,
}

impl BigQueryWarehouse {
    pub async fn from_key_path(
        key_path: impl AsRef<Path>,
        poll_interval: Duration,
    ) -> Result<Self, WarehouseError> {
        let key = tokio::fs::read_to_string(key_path.as_ref()).await?;
        let key = parse_service_account_key(key)?;
        let client = Client::from_service_account_key(key, false).await?;
        Ok(Self {
            client,
            poll_interval,
        })
    }

    fn table_reference(table: &TableRef) -> TableReference {
        TableReference::new(&table.project_id, &table.dataset_id, &table.table_id)
    }

    fn handle_from(job: Job, project_id: &str) -> Result<JobHandle, WarehouseError> {
        let reference = job.job_reference.ok_or(WarehouseError::MissingJobReference)?;
        let job_id = reference.job_id.ok_or(WarehouseError::MissingJobReference)?;
        Ok(JobHandle {
            project_id: reference.project_id.unwrap_or_else(|| project_id.to_string()),
            job_id,
            location: reference.location,
        })
    }
}

#[async_trait]
impl CloudWarehouse for BigQueryWarehouse {
    async fn start_query_job(&self, body: &QueryJobBody) -> Result<JobHandle, WarehouseError> {
        let spec = &body.configuration.query;
        let project_id = body.job_reference.project_id.as_str();
        let job = Job {
            job_reference: Some(JobReference {
                project_id: Some(project_id.to_string()),
                job_id: Some(body.job_reference.job_id.clone()),
                ..Default::default()
            }),
            configuration: Some(JobConfiguration {
                query: Some(JobConfigurationQuery {
                    query: spec.query.clone(),
                    destination_table: Some(Self::table_reference(&TableRef::from(
                        &spec.destination_table,
                    ))),
                    maximum_bytes_billed: Some(spec.maximum_bytes_billed.to_string()),
                    use_legacy_sql: Some(spec.use_legacy_sql),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        info!(
            job_id = %body.job_reference.job_id,
            destination = %TableRef::from(&spec.destination_table),
            "starting query job"
        );
        let inserted = self.client.job().insert(project_id, job).await?;
        Self::handle_from(inserted, project_id)
    }

    async fn start_load_job(&self, request: &LoadJobRequest) -> Result<JobHandle, WarehouseError> {
        let job = Job {
            configuration: Some(JobConfiguration {
                load: Some(JobConfigurationLoad {
                    source_uris: Some(vec![request.source_uri.clone()]),
                    destination_table: Some(Self::table_reference(&request.destination)),
                    source_format: Some(request.source_format.clone()),
                    write_disposition: Some(request.write_disposition.as_str().to_string()),
                    autodetect: Some(request.autodetect),
                    skip_leading_rows: request.skip_leading_rows,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        info!(
            source = %request.source_uri,
            destination = %request.destination,
            disposition = request.write_disposition.as_str(),
            "starting load job"
        );
        let inserted = self.client.job().insert(&request.project_id, job).await?;
        Self::handle_from(inserted, &request.project_id)
    }

    async fn wait_for_job(&self, job: &JobHandle) -> Result<(), WarehouseError> {
        loop {
            let current = self
                .client
                .job()
                .get_job(&job.project_id, &job.job_id, job.location.as_deref())
                .await?;
            let status = current.status.unwrap_or_default();
            if status.state.as_deref() == Some("DONE") {
                if let Some(error) = status.error_result {
                    return Err(WarehouseError::JobFailed {
                        job_id: job.job_id.clone(),
                        message: error.message.unwrap_or_else(|| "unknown error".to_string()),
                    });
                }
                info!(job_id = %job.job_id, "job finished");
                return Ok(());
            }
            debug!(job_id = %job.job_id, state = ?status.state, "job still running");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn delete_table(&self, table: &TableRef) -> Result<bool, WarehouseError> {
        match self
            .client
            .table()
            .delete(&table.project_id, &table.dataset_id, &table.table_id)
            .await
        {
            Ok(()) => {
                info!(%table, "deleted table");
                Ok(true)
            }
            Err(BQError::ResponseError { error }) if error.error.code == 404 => {
                warn!(%table, "table already absent");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}
