//! Dashboard rebuild: one dated query job into a partition table, then retention pruning.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use stockfeed_core::{render_template, TemplateError};
use stockfeed_storage::{
    read_text_file, CloudWarehouse, DestinationTable, JobReferenceBody, QueryJobBody,
    QueryJobConfiguration, QueryJobSpec, TableRef, WarehouseError, MAXIMUM_BYTES_BILLED,
};
use thiserror::Error;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

const URL_DATE_FORMAT: &str = "%Y%m%d";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardJobConfig {
    pub query_path: PathBuf,
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
    pub dest_project_id: String,
    pub dest_dataset_id: String,
    /// Partition name pattern; `{}` is replaced by the `YYYYMMDD` date.
    pub dest_table_id: String,
    pub total_days: u32,
}

impl DashboardJobConfig {
    fn template_values(&self, date: &str) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("date", date.to_string()),
            ("query_path", self.query_path.display().to_string()),
            ("project_id", self.project_id.clone()),
            ("dataset_id", self.dataset_id.clone()),
            ("table_id", self.table_id.clone()),
            ("dest_project_id", self.dest_project_id.clone()),
            ("dest_dataset_id", self.dest_dataset_id.clone()),
            ("dest_table_id", self.dest_table_id.clone()),
            ("total_days", self.total_days.to_string()),
        ])
    }

    pub fn dated_table(&self, date: &str) -> TableRef {
        TableRef::new(
            &self.dest_project_id,
            &self.dest_dataset_id,
            dated_table_id(&self.dest_table_id, date),
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DateError {
    #[error("date `{0}` is not in YYYYMMDD format")]
    InvalidFormat(String),
}

#[derive(Debug, Error)]
pub enum DashboardError {
    #[error(transparent)]
    Date(#[from] DateError),
    #[error("reading dashboard query: {0}")]
    QueryFile(String),
    #[error("rendering dashboard query: {0}")]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
}

pub fn yesterday_date(today: NaiveDate) -> NaiveDate {
    today - Days::new(1)
}

fn parse_url_date(input: &str) -> Result<NaiveDate, DateError> {
    let invalid = || DateError::InvalidFormat(input.to_string());
    // `%Y` on its own also accepts a sign and leading whitespace.
    if input.len() != 8 || !input.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    NaiveDate::parse_from_str(input, URL_DATE_FORMAT).map_err(|_| invalid())
}

/// `20171010` -> `2017-10-10`.
pub fn format_date(input: &str) -> Result<String, DateError> {
    format_date_as(input, "%Y-%m-%d")
}

pub fn format_date_as(input: &str, format: &str) -> Result<String, DateError> {
    Ok(parse_url_date(input)?.format(format).to_string())
}

/// Absent or empty stays `None`; anything else must be a valid `YYYYMMDD` date.
pub fn process_url_date(date: Option<&str>) -> Result<Option<String>, DateError> {
    match date {
        None | Some("") => Ok(None),
        Some(raw) => parse_url_date(raw).map(|_| Some(raw.to_string())),
    }
}

pub fn dated_table_id(pattern: &str, date: &str) -> String {
    pattern.replacen("{}", date, 1)
}

pub async fn render_dashboard_query(
    setup: &DashboardJobConfig,
    date: &str,
) -> Result<String, DashboardError> {
    let template = read_text_file(&setup.query_path)
        .await
        .map_err(|err| DashboardError::QueryFile(format!("{err:#}")))?;
    let rendered = render_template(&template, &setup.template_values(date))?;
    Ok(rendered.trim().to_string())
}

pub async fn search_query_job_body(
    setup: &DashboardJobConfig,
    date: &str,
    job_id: Uuid,
) -> Result<QueryJobBody, DashboardError> {
    let query = render_dashboard_query(setup, date).await?;
    Ok(QueryJobBody {
        job_reference: JobReferenceBody {
            project_id: setup.project_id.clone(),
            job_id: job_id.to_string(),
        },
        configuration: QueryJobConfiguration {
            query: QueryJobSpec {
                destination_table: DestinationTable {
                    dataset_id: setup.dest_dataset_id.clone(),
                    table_id: dated_table_id(&setup.dest_table_id, date),
                    project_id: setup.dest_project_id.clone(),
                },
                maximum_bytes_billed: MAXIMUM_BYTES_BILLED,
                query,
                use_legacy_sql: false,
            },
        },
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DashboardOutcome {
    pub date: String,
    pub job_id: String,
    pub destination: TableRef,
    pub pruned: TableRef,
    pub pruned_existed: bool,
}

/// Runs the dated dashboard query and drops the partition that fell out of the retention window.
///
/// `date` comes straight from the request; without one the run covers yesterday. Retention is
/// measured from `today`, not from `date`.
pub async fn update_dashboard_tables(
    warehouse: &dyn CloudWarehouse,
    setup: &DashboardJobConfig,
    date: Option<&str>,
    today: NaiveDate,
) -> Result<DashboardOutcome, DashboardError> {
    let date = match process_url_date(date)? {
        Some(date) => date,
        None => yesterday_date(today).format(URL_DATE_FORMAT).to_string(),
    };
    let span = info_span!("update_dashboard_tables", date = %date);

    async move {
        let body = search_query_job_body(setup, &date, Uuid::new_v4()).await?;
        let destination = TableRef::from(&body.configuration.query.destination_table);
        let job = warehouse.start_query_job(&body).await?;
        warehouse.wait_for_job(&job).await?;

        let cutoff = today - Days::new(1 + u64::from(setup.total_days));
        let pruned = setup.dated_table(&cutoff.format(URL_DATE_FORMAT).to_string());
        let pruned_existed = warehouse.delete_table(&pruned).await?;
        info!(%destination, %pruned, pruned_existed, "dashboard tables updated");

        Ok(DashboardOutcome {
            date,
            job_id: job.job_id,
            destination,
            pruned,
            pruned_existed,
        })
    }
    .instrument(span)
    .await
}
