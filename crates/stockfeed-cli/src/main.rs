use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stockfeed_core::{OutputFormat, UnmatchedPolicy};
use stockfeed_storage::{BigQueryWarehouse, HttpFetcher};
use stockfeed_sync::dashboard::update_dashboard_tables;
use stockfeed_sync::{build_scheduler, FeedConfig, HttpTaskQueue, JobsFactory, TaskQueue};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "stockfeed")]
#[command(about = "Stock feed exporter and dashboard job runner")]
struct Cli {
    /// Config file; falls back to STOCKFEED_CONFIG, then stockfeed.yaml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Export one store's merged index and warehouse data.
    Feed {
        store: String,
        /// Documents per index page.
        #[arg(long)]
        rows: Option<u64>,
        #[arg(long)]
        max_in_flight: Option<usize>,
        #[arg(long)]
        format: Option<OutputFormat>,
        #[arg(long)]
        unmatched: Option<UnmatchedPolicy>,
        #[arg(long)]
        staging_dir: Option<PathBuf>,
        /// Stage the payload locally and skip the cloud load.
        #[arg(long)]
        local_only: bool,
    },
    /// Run the worker and scheduler HTTP service.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Enqueue a named job on the task queue.
    Enqueue {
        job: String,
        #[arg(long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
    },
    /// Run configured cron schedules until interrupted.
    Schedule,
    /// Rebuild the dashboard table in-process.
    Dashboard {
        /// YYYYMMDD; defaults to yesterday.
        #[arg(long)]
        date: Option<String>,
    },
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    if key.is_empty() {
        return Err(format!("empty key in `{raw}`"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

fn load_config(path: Option<PathBuf>) -> Result<FeedConfig> {
    match path {
        Some(path) => {
            let mut config = FeedConfig::from_path(&path)?;
            config.apply_overrides(|key| std::env::var(key).ok());
            Ok(config)
        }
        None => FeedConfig::from_env(),
    }
}

fn task_queue(config: &FeedConfig) -> Result<Arc<dyn TaskQueue>> {
    let http = Arc::new(HttpFetcher::new(config.http.client_config())?);
    Ok(Arc::new(HttpTaskQueue::new(
        http,
        config.task_queue.targets.clone(),
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info")?;
    let cli = Cli::parse();
    let mut config = load_config(cli.config)?;

    match cli.command {
        Commands::Feed {
            store,
            rows,
            max_in_flight,
            format,
            unmatched,
            staging_dir,
            local_only,
        } => {
            let pipeline = &mut config.pipeline;
            if let Some(rows) = rows {
                pipeline.page_size = rows;
            }
            if let Some(limit) = max_in_flight {
                pipeline.max_in_flight_pages = limit;
            }
            if let Some(format) = format {
                pipeline.output_format = format;
            }
            if let Some(policy) = unmatched {
                pipeline.unmatched = policy;
            }
            if staging_dir.is_some() {
                pipeline.staging_dir = staging_dir;
            }
            pipeline.local_only |= local_only;

            let summary = stockfeed_sync::run_feed_from_config(&config, &store).await?;
            println!(
                "feed complete: run_id={} store={} pages={} merged={} dropped={}",
                summary.run_id,
                summary.store,
                summary.pages_planned,
                summary.records_merged,
                summary.documents_dropped
            );
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.web.port = port;
            }
            stockfeed_web::serve(&config).await?;
        }
        Commands::Enqueue { job, params } => {
            let queue = task_queue(&config)?;
            let mut scheduled = JobsFactory::with_jobs(&config.jobs).factor_job(&job)?;
            let params: BTreeMap<String, String> = params.into_iter().collect();
            scheduled.run(queue.as_ref(), &params).await?;
            println!("{scheduled}");
        }
        Commands::Schedule => {
            let queue = task_queue(&config)?;
            let factory = Arc::new(JobsFactory::with_jobs(&config.jobs));
            let mut sched = build_scheduler(&config.schedules, factory, queue).await?;
            sched.start().await.context("starting scheduler")?;
            info!(entries = config.schedules.len(), "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Dashboard { date } => {
            let setup = config.dashboard()?;
            let gcp = config.gcp()?;
            let warehouse = BigQueryWarehouse::from_key_path(
                gcp.key_path()?,
                Duration::from_secs(config.pipeline.job_poll_interval_secs.max(1)),
            )
            .await?;
            let today = chrono::Local::now().date_naive();
            let outcome = update_dashboard_tables(&warehouse, setup, date.as_deref(), today).await?;
            println!(
                "dashboard updated: date={} table={} pruned={} (existed: {})",
                outcome.date, outcome.destination, outcome.pruned, outcome.pruned_existed
            );
        }
    }

    Ok(())
}
