//! YAML configuration for feed runs, the scheduler and the dashboard worker.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use stockfeed_core::{OutputFormat, UnmatchedPolicy};
use stockfeed_sources::{IndexEndpoint, PoolSettings, WarehouseConnection};
use stockfeed_storage::HttpClientConfig;

use crate::dashboard::DashboardJobConfig;

pub const DEFAULT_CONFIG_PATH: &str = "stockfeed.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default)]
    pub stores: BTreeMap<String, StoreConfig>,
    #[serde(default = "default_warehouse_query_path")]
    pub warehouse_query_path: PathBuf,
    #[serde(default)]
    pub gcp: Option<GcpConfig>,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub http: HttpSettings,
    /// Extra scheduler jobs on top of the built-in registry.
    #[serde(default)]
    pub jobs: BTreeMap<String, JobSpec>,
    #[serde(default)]
    pub dashboard: Option<DashboardJobConfig>,
    #[serde(default)]
    pub task_queue: TaskQueueConfig,
    #[serde(default)]
    pub schedules: Vec<ScheduleEntry>,
    #[serde(default)]
    pub web: WebSettings,
}

fn default_warehouse_query_path() -> PathBuf {
    PathBuf::from("fixtures/sql/skus.sql")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub index: IndexEndpoint,
    pub warehouse: WarehouseConnection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcpConfig {
    pub project_id: String,
    /// Service account key; `GOOGLE_APPLICATION_CREDENTIALS` wins when set.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    pub bigquery: BigQueryTarget,
    pub storage: StorageTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BigQueryTarget {
    pub dataset: String,
    pub table: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageTarget {
    pub bucket: String,
    pub blob: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub page_size: u64,
    pub max_in_flight_pages: usize,
    pub warehouse_pool_size: u32,
    pub warehouse_acquire_timeout_secs: u64,
    pub output_format: OutputFormat,
    pub unmatched: UnmatchedPolicy,
    pub staging_dir: Option<PathBuf>,
    pub local_only: bool,
    pub job_poll_interval_secs: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            page_size: 30_000,
            max_in_flight_pages: 15,
            warehouse_pool_size: 15,
            warehouse_acquire_timeout_secs: 60,
            output_format: OutputFormat::Ndjson,
            unmatched: UnmatchedPolicy::Drop,
            staging_dir: None,
            local_only: false,
            job_poll_interval_secs: 2,
        }
    }
}

impl PipelineSettings {
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_connections: self.warehouse_pool_size,
            acquire_timeout: Duration::from_secs(self.warehouse_acquire_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_secs: u64,
    pub user_agent: String,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            user_agent: "stockfeed/0.1".to_string(),
            global_concurrency: 16,
            per_host_concurrency: 16,
        }
    }
}

impl HttpSettings {
    pub fn client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.global_concurrency,
            per_scope_concurrency: self.per_host_concurrency,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub url: String,
    pub target: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskQueueConfig {
    /// Target name -> base URL the job's path is appended to.
    #[serde(default)]
    pub targets: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Six-field cron expression (seconds first).
    pub cron: String,
    pub job: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSettings {
    pub bind: String,
    pub port: u16,
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl FeedConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing feed config yaml")
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Reads `STOCKFEED_CONFIG` (default `stockfeed.yaml`) and applies environment overrides.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var("STOCKFEED_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut config = Self::from_path(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("STOCKFEED_PAGE_SIZE").and_then(|v| v.parse().ok()) {
            self.pipeline.page_size = v;
        }
        if let Some(v) = lookup("STOCKFEED_MAX_IN_FLIGHT").and_then(|v| v.parse().ok()) {
            self.pipeline.max_in_flight_pages = v;
        }
        if let Some(v) = lookup("STOCKFEED_WEB_PORT").and_then(|v| v.parse().ok()) {
            self.web.port = v;
        }
        if let Some(path) = lookup("GOOGLE_APPLICATION_CREDENTIALS").filter(|v| !v.is_empty()) {
            if let Some(gcp) = self.gcp.as_mut() {
                gcp.key_path = Some(PathBuf::from(path));
            }
        }
    }

    pub fn store(&self, name: &str) -> Result<&StoreConfig> {
        self.stores.get(name).with_context(|| {
            let known: Vec<&str> = self.stores.keys().map(String::as_str).collect();
            format!("store `{name}` is not configured (known: {})", known.join(", "))
        })
    }

    pub fn gcp(&self) -> Result<&GcpConfig> {
        self.gcp.as_ref().context("`gcp` section is required for cloud loads")
    }

    pub fn dashboard(&self) -> Result<&DashboardJobConfig> {
        self.dashboard
            .as_ref()
            .context("`dashboard` section is required for the worker")
    }
}

impl GcpConfig {
    pub fn key_path(&self) -> Result<&Path> {
        self.key_path
            .as_deref()
            .context("no service account key: set gcp.key_path or GOOGLE_APPLICATION_CREDENTIALS")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
stores:
  dafiti:
    index:
      host: http://solr:8983/solr/dafiti/
      fields: [sku, name, brand]
    warehouse:
      host: redshift.internal
      dbname: dw
      user: reader
      password: secret
warehouse_query_path: queries/skus.sql
gcp:
  project_id: feeds-project
  key_path: /etc/keys/feeds.json
  bigquery: {dataset: feeds, table: stock}
  storage: {bucket: feeds-bucket, blob: stock/dafiti.json.gz}
pipeline:
  page_size: 500
  output_format: csv
  unmatched: fail
jobs:
  export_stock:
    url: /export_stock
    target: worker
task_queue:
  targets:
    worker: http://worker:8080
schedules:
  - cron: "0 0 4 * * *"
    job: update_dashboard_tables
"#;

    #[test]
    fn parses_sample_and_keeps_defaults_for_omitted_fields() {
        let config = FeedConfig::from_yaml_str(SAMPLE).unwrap();
        let store = config.store("dafiti").unwrap();
        assert_eq!(store.index.query, "*:*");
        assert_eq!(store.warehouse.port, 5439);
        assert_eq!(config.pipeline.page_size, 500);
        assert_eq!(config.pipeline.max_in_flight_pages, 15);
        assert_eq!(config.pipeline.output_format, OutputFormat::Csv);
        assert_eq!(config.pipeline.unmatched, UnmatchedPolicy::Fail);
        assert_eq!(config.jobs["export_stock"].target, "worker");
        assert_eq!(config.schedules[0].job, "update_dashboard_tables");
        assert!(config.schedules[0].params.is_empty());
        assert_eq!(config.web.port, 8080);
    }

    #[test]
    fn env_overrides_replace_deployment_knobs() {
        let mut config = FeedConfig::from_yaml_str(SAMPLE).unwrap();
        config.apply_overrides(|key| match key {
            "STOCKFEED_PAGE_SIZE" => Some("42".into()),
            "STOCKFEED_MAX_IN_FLIGHT" => Some("3".into()),
            "STOCKFEED_WEB_PORT" => Some("not-a-port".into()),
            "GOOGLE_APPLICATION_CREDENTIALS" => Some("/run/creds.json".into()),
            _ => None,
        });
        assert_eq!(config.pipeline.page_size, 42);
        assert_eq!(config.pipeline.max_in_flight_pages, 3);
        assert_eq!(config.web.port, 8080);
        assert_eq!(
            config.gcp().unwrap().key_path().unwrap(),
            Path::new("/run/creds.json")
        );
    }

    #[test]
    fn unknown_store_names_known_ones() {
        let config = FeedConfig::from_yaml_str(SAMPLE).unwrap();
        let err = config.store("kanui").unwrap_err().to_string();
        assert!(err.contains("kanui"));
        assert!(err.contains("dafiti"));
    }

    #[test]
    fn shipped_example_config_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../stockfeed.example.yaml");
        let config = FeedConfig::from_path(path).unwrap();
        assert_eq!(config.store("dafiti").unwrap().index.fields.len(), 10);
        let dashboard = config.dashboard().unwrap();
        assert_eq!(dashboard.dest_table_id, "search_{}");
        assert_eq!(dashboard.total_days, 30);
        assert_eq!(config.task_queue.targets["worker"], "http://localhost:8080");
    }

    #[test]
    fn shipped_example_jobs_point_at_configured_targets() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../stockfeed.example.yaml");
        let config = FeedConfig::from_path(path).unwrap();
        let queue = crate::HttpTaskQueue::new(
            std::sync::Arc::new(stockfeed_storage::HttpFetcher::new(Default::default()).unwrap()),
            config.task_queue.targets.clone(),
        );
        let factory = crate::JobsFactory::with_jobs(&config.jobs);
        for name in factory.job_names() {
            let job = factory.factor_job(name).unwrap();
            assert!(
                queue.task_url(&job.target, &job.url).is_ok(),
                "job `{name}` targets unknown `{}`",
                job.target
            );
        }
        assert_eq!(config.jobs["export_stock"].target, "feeds");
    }

    #[test]
    fn from_path_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = FeedConfig::from_path(dir.path().join("absent.yaml")).unwrap_err();
        assert!(format!("{err:#}").contains("absent.yaml"));
    }
}
