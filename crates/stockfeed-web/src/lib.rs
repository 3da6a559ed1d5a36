//! Axum service exposing the dashboard worker and the job scheduler endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{rejection::FormRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Router,
};
use chrono::{Local, NaiveDate};
use serde::Deserialize;
use stockfeed_storage::{BigQueryWarehouse, CloudWarehouse, HttpFetcher};
use stockfeed_sync::dashboard::{update_dashboard_tables, DashboardError, DashboardJobConfig};
use stockfeed_sync::{FeedConfig, HttpTaskQueue, JobsFactory, SchedulerError, TaskQueue};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "stockfeed-web";

pub type Clock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

#[derive(Clone)]
struct DashboardWorker {
    setup: DashboardJobConfig,
    warehouse: Arc<dyn CloudWarehouse>,
}

#[derive(Clone)]
pub struct AppState {
    jobs: JobsFactory,
    queue: Arc<dyn TaskQueue>,
    dashboard: Option<DashboardWorker>,
    today: Clock,
}

impl AppState {
    pub fn new(jobs: JobsFactory, queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            jobs,
            queue,
            dashboard: None,
            today: Arc::new(|| Local::now().date_naive()),
        }
    }

    pub fn with_dashboard(
        mut self,
        setup: DashboardJobConfig,
        warehouse: Arc<dyn CloudWarehouse>,
    ) -> Self {
        self.dashboard = Some(DashboardWorker { setup, warehouse });
        self
    }

    pub fn with_clock(mut self, today: Clock) -> Self {
        self.today = today;
        self
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/update_dashboard_tables", post(update_dashboard_tables_handler))
        .route("/run_job/{job_name}", get(run_job_handler))
        .route("/run_job/{job_name}/", get(run_job_handler))
        .with_state(Arc::new(state))
}

pub async fn state_from_config(config: &FeedConfig) -> anyhow::Result<AppState> {
    let http = Arc::new(HttpFetcher::new(config.http.client_config())?);
    let queue = Arc::new(HttpTaskQueue::new(http, config.task_queue.targets.clone()));
    let state = AppState::new(JobsFactory::with_jobs(&config.jobs), queue);

    let Some(setup) = config.dashboard.clone() else {
        return Ok(state);
    };
    let gcp = config.gcp()?;
    let warehouse = BigQueryWarehouse::from_key_path(
        gcp.key_path()?,
        Duration::from_secs(config.pipeline.job_poll_interval_secs.max(1)),
    )
    .await
    .context("authenticating bigquery client for the dashboard worker")?;
    Ok(state.with_dashboard(setup, Arc::new(warehouse)))
}

pub async fn serve(config: &FeedConfig) -> anyhow::Result<()> {
    let state = state_from_config(config).await?;
    let listener = TcpListener::bind((config.web.bind.as_str(), config.web.port))
        .await
        .with_context(|| format!("binding {}:{}", config.web.bind, config.web.port))?;
    info!(addr = %listener.local_addr()?, "worker listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = FeedConfig::from_env()?;
    serve(&config).await
}

async fn healthz_handler() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct DashboardForm {
    date: Option<String>,
}

async fn update_dashboard_tables_handler(
    State(state): State<Arc<AppState>>,
    form: Result<Form<DashboardForm>, FormRejection>,
) -> Response {
    let date = match form {
        Ok(Form(form)) => form.date,
        // A bare POST carries no form body at all.
        Err(FormRejection::InvalidFormContentType(_)) => None,
        Err(rejection) => return (StatusCode::BAD_REQUEST, rejection.body_text()).into_response(),
    };
    let Some(worker) = state.dashboard.as_ref() else {
        return text(
            StatusCode::SERVICE_UNAVAILABLE,
            "dashboard job is not configured".to_string(),
        );
    };

    let today = (state.today)();
    match update_dashboard_tables(worker.warehouse.as_ref(), &worker.setup, date.as_deref(), today)
        .await
    {
        Ok(_) => "finished".into_response(),
        Err(DashboardError::Date(err)) => text(StatusCode::BAD_REQUEST, err.to_string()),
        Err(err) => {
            error!(error = %err, "dashboard update failed");
            text(StatusCode::INTERNAL_SERVER_ERROR, format!("Server error: {err}"))
        }
    }
}

async fn run_job_handler(
    State(state): State<Arc<AppState>>,
    Path(job_name): Path<String>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Response {
    let mut job = match state.jobs.factor_job(&job_name) {
        Ok(job) => job,
        Err(err) => return text(StatusCode::NOT_FOUND, err.to_string()),
    };
    match job.run(state.queue.as_ref(), &params).await {
        Ok(_) => job.to_string().into_response(),
        Err(err @ (SchedulerError::Incomplete | SchedulerError::UnknownTarget(_))) => {
            error!(job = %job_name, error = %err, "job could not be enqueued");
            text(StatusCode::INTERNAL_SERVER_ERROR, format!("Server error: {err}"))
        }
        Err(err @ SchedulerError::Delivery { .. }) => {
            error!(job = %job_name, error = %err, "task delivery failed");
            text(StatusCode::BAD_GATEWAY, format!("Server error: {err}"))
        }
        Err(err) => text(StatusCode::NOT_FOUND, err.to_string()),
    }
}

fn text(status: StatusCode, body: String) -> Response {
    (status, body).into_response()
}
