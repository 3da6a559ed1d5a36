//! Background job dispatch: a named-job registry, a task queue seam and cron triggers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use stockfeed_storage::HttpFetcher;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::config::{JobSpec, ScheduleEntry};

pub const UPDATE_DASHBOARD_TABLES: &str = "update_dashboard_tables";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("unknown job `{0}`")]
    UnknownJob(String),
    #[error("job needs both a url and a target")]
    Incomplete,
    #[error("no base url configured for target `{0}`")]
    UnknownTarget(String),
    #[error("task {task} was not delivered: {message}")]
    Delivery { task: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueuedTask {
    pub name: String,
    pub eta: DateTime<Utc>,
}

/// Push queue for background HTTP jobs.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(
        &self,
        url: &str,
        target: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<EnqueuedTask, SchedulerError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerJob {
    pub url: String,
    pub target: String,
    task: Option<EnqueuedTask>,
}

impl SchedulerJob {
    pub fn new(url: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            target: target.into(),
            task: None,
        }
    }

    pub fn task(&self) -> Option<&EnqueuedTask> {
        self.task.as_ref()
    }

    pub async fn run(
        &mut self,
        queue: &dyn TaskQueue,
        params: &BTreeMap<String, String>,
    ) -> Result<&EnqueuedTask, SchedulerError> {
        if self.url.is_empty() || self.target.is_empty() {
            return Err(SchedulerError::Incomplete);
        }
        let task = queue.enqueue(&self.url, &self.target, params).await?;
        Ok(self.task.insert(task))
    }
}

impl fmt::Display for SchedulerJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.task {
            None => f.write_str("No task has been enqueued so far"),
            Some(task) => write!(
                f,
                "Task {} enqueued, ETA {}",
                task.name,
                task.eta.to_rfc3339_opts(SecondsFormat::Secs, true)
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobsFactory {
    jobs: BTreeMap<String, JobSpec>,
}

impl Default for JobsFactory {
    fn default() -> Self {
        let mut jobs = BTreeMap::new();
        jobs.insert(
            UPDATE_DASHBOARD_TABLES.to_string(),
            JobSpec {
                url: "/update_dashboard_tables".to_string(),
                target: "worker".to_string(),
            },
        );
        Self { jobs }
    }
}

impl JobsFactory {
    /// Built-in jobs plus `extra`; entries in `extra` override built-ins of the same name.
    pub fn with_jobs(extra: &BTreeMap<String, JobSpec>) -> Self {
        let mut factory = Self::default();
        factory
            .jobs
            .extend(extra.iter().map(|(name, spec)| (name.clone(), spec.clone())));
        factory
    }

    pub fn job_names(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(String::as_str)
    }

    pub fn factor_job(&self, name: &str) -> Result<SchedulerJob, SchedulerError> {
        self.jobs
            .get(name)
            .map(|spec| SchedulerJob::new(&spec.url, &spec.target))
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))
    }
}

/// Posts the job's params as a form to `<target base url><job url>`. A task counts as
/// enqueued only once the target accepted it.
pub struct HttpTaskQueue {
    http: Arc<HttpFetcher>,
    targets: BTreeMap<String, String>,
}

impl HttpTaskQueue {
    pub fn new(http: Arc<HttpFetcher>, targets: BTreeMap<String, String>) -> Self {
        Self { http, targets }
    }

    pub fn task_url(&self, target: &str, url: &str) -> Result<String, SchedulerError> {
        let base = self
            .targets
            .get(target)
            .ok_or_else(|| SchedulerError::UnknownTarget(target.to_string()))?;
        Ok(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            url.trim_start_matches('/')
        ))
    }
}

#[async_trait]
impl TaskQueue for HttpTaskQueue {
    async fn enqueue(
        &self,
        url: &str,
        target: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<EnqueuedTask, SchedulerError> {
        let task_url = self.task_url(target, url)?;
        let task = EnqueuedTask {
            name: format!("{target}-{}", Uuid::new_v4().simple()),
            eta: Utc::now(),
        };
        let form: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let span = info_span!("background_task", task = %task.name, url = %task_url);

        let response = self
            .http
            .post_form(target, &task_url, &form)
            .instrument(span)
            .await
            .map_err(|err| SchedulerError::Delivery {
                task: task.name.clone(),
                message: err.to_string(),
            })?;

        info!(
            task = %task.name,
            queue_target = target,
            url,
            status = %response.status,
            "task enqueued"
        );
        Ok(task)
    }
}

/// Cron triggers that enqueue configured jobs. Expressions use six fields (seconds first).
pub async fn build_scheduler(
    entries: &[ScheduleEntry],
    factory: Arc<JobsFactory>,
    queue: Arc<dyn TaskQueue>,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for entry in entries {
        factory
            .factor_job(&entry.job)
            .with_context(|| format!("schedule `{}`", entry.cron))?;

        let job_name = entry.job.clone();
        let params = entry.params.clone();
        let factory = factory.clone();
        let queue = queue.clone();
        let job = Job::new_async(entry.cron.as_str(), move |_uuid, _lock| {
            let job_name = job_name.clone();
            let params = params.clone();
            let factory = factory.clone();
            let queue = queue.clone();
            Box::pin(async move {
                let outcome = match factory.factor_job(&job_name) {
                    Ok(mut job) => {
                        let enqueued = job.run(queue.as_ref(), &params).await.map(|_| ());
                        enqueued.map(|()| job.to_string())
                    }
                    Err(err) => Err(err),
                };
                match outcome {
                    Ok(status) => info!(job = %job_name, %status, "scheduled job fired"),
                    Err(err) => error!(job = %job_name, error = %err, "scheduled job failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {}", entry.cron))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(sched)
}
