//! Feed pipeline orchestration: page fan-out, warehouse joins, bulk load, plus the scheduler
//! and dashboard worker jobs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use stockfeed_core::{
    document_ids, encode_records, merge_page, plan_pages, MergeOutcome, MergedRecord,
    OutputFormat, PageRequest, UnmatchedPolicy,
};
use stockfeed_sources::{IndexReader, RedshiftSource, SolrIndexReader, WarehouseSource};
use stockfeed_storage::{
    read_text_file, BigQueryWarehouse, GcsObjectStore, HttpFetcher, StagingStore, TableRef,
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, debug_span, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod dashboard;
pub mod loader;
pub mod scheduler;

pub use config::FeedConfig;
pub use loader::{BulkLoader, CloudTarget, GcsBigQueryLoader, LoadReport, LocalOnlyLoader};
pub use scheduler::{
    build_scheduler, EnqueuedTask, HttpTaskQueue, JobsFactory, SchedulerError, SchedulerJob,
    TaskQueue,
};

pub const CRATE_NAME: &str = "stockfeed-sync";

const DEFAULT_STAGING_DIR: &str = "./staging";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    pub page_size: u64,
    pub max_in_flight_pages: usize,
    pub id_field: String,
    pub output_format: OutputFormat,
    pub unmatched: UnmatchedPolicy,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedRunSummary {
    pub run_id: Uuid,
    pub store: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_documents: u64,
    pub pages_planned: usize,
    pub documents_fetched: usize,
    pub records_merged: usize,
    pub documents_dropped: usize,
    /// `None` when nothing merged and the load was skipped.
    pub load: Option<LoadReport>,
}

struct PageResult {
    index: usize,
    fetched: usize,
    merged: MergeOutcome,
}

pub struct FeedPipeline {
    store: String,
    options: PipelineOptions,
    index: Arc<dyn IndexReader>,
    warehouse: Arc<dyn WarehouseSource>,
    loader: Arc<dyn BulkLoader>,
}

impl FeedPipeline {
    pub fn new(
        store: impl Into<String>,
        options: PipelineOptions,
        index: Arc<dyn IndexReader>,
        warehouse: Arc<dyn WarehouseSource>,
        loader: Arc<dyn BulkLoader>,
    ) -> Self {
        Self {
            store: store.into(),
            options,
            index,
            warehouse,
            loader,
        }
    }

    /// One full export. The warehouse pool is closed before returning, whatever the outcome.
    pub async fn run_once(&self) -> Result<FeedRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("feed_run", %run_id, store = %self.store);
        let result = self.execute(run_id).instrument(span.clone()).await;
        self.warehouse.close().instrument(span).await;
        result
    }

    async fn execute(&self, run_id: Uuid) -> Result<FeedRunSummary> {
        let started_at = Utc::now();
        let total_documents = self.index.count().await.context("counting index documents")?;
        let pages = plan_pages(total_documents, self.options.page_size);
        let pages_planned = pages.len();
        info!(
            total_documents,
            pages = pages_planned,
            page_size = self.options.page_size,
            "feed run planned"
        );

        let results = self.run_pages(pages).await?;

        let mut documents_fetched = 0usize;
        let mut documents_dropped = 0usize;
        let mut records: Vec<MergedRecord> = Vec::new();
        for result in results {
            documents_fetched += result.fetched;
            documents_dropped += result.merged.unmatched.len();
            records.extend(result.merged.records);
        }
        let records_merged = records.len();

        let load = if records.is_empty() {
            warn!("no merged records, skipping load");
            None
        } else {
            let payload = encode_records(self.options.output_format, &records)
                .context("encoding merged records")?;
            drop(records);
            Some(self.loader.load(&self.store, &payload).await?)
        };

        let summary = FeedRunSummary {
            run_id,
            store: self.store.clone(),
            started_at,
            finished_at: Utc::now(),
            total_documents,
            pages_planned,
            documents_fetched,
            records_merged,
            documents_dropped,
            load,
        };
        info!(
            fetched = summary.documents_fetched,
            merged = summary.records_merged,
            dropped = summary.documents_dropped,
            "feed run finished"
        );
        Ok(summary)
    }

    /// Runs every page unit under the in-flight limit. Results come back in completion order;
    /// the first failure aborts the remaining units.
    async fn run_pages(&self, pages: Vec<PageRequest>) -> Result<Vec<PageResult>> {
        let limiter = Arc::new(Semaphore::new(self.options.max_in_flight_pages.max(1)));
        let mut units = JoinSet::new();

        for page in pages {
            let limiter = limiter.clone();
            let index = self.index.clone();
            let warehouse = self.warehouse.clone();
            let id_field = self.options.id_field.clone();
            let policy = self.options.unmatched;
            units.spawn(
                async move {
                    let _permit = limiter
                        .acquire_owned()
                        .await
                        .context("page limiter closed")?;
                    process_page(index.as_ref(), warehouse.as_ref(), page, &id_field, policy).await
                }
                .instrument(debug_span!("page", index = page.index, offset = page.offset)),
            );
        }

        let mut results = Vec::with_capacity(units.len());
        while let Some(joined) = units.join_next().await {
            match joined.context("page unit panicked")? {
                Ok(result) => {
                    debug!(page = result.index, merged = result.merged.records.len(), "page done");
                    results.push(result);
                }
                Err(err) => {
                    units.abort_all();
                    return Err(err);
                }
            }
        }
        Ok(results)
    }
}

async fn process_page(
    index: &dyn IndexReader,
    warehouse: &dyn WarehouseSource,
    page: PageRequest,
    id_field: &str,
    policy: UnmatchedPolicy,
) -> Result<PageResult> {
    let documents = index
        .read_page(&page)
        .await
        .with_context(|| format!("reading index page {}", page.index))?;
    let fetched = documents.len();
    let ids = document_ids(&documents, id_field)
        .with_context(|| format!("collecting identifiers of page {}", page.index))?;
    let rows = warehouse
        .fetch_rows(page.index, &ids)
        .await
        .with_context(|| format!("warehouse lookup for page {}", page.index))?;
    let merged = merge_page(documents, &rows, id_field, policy)
        .with_context(|| format!("merging page {}", page.index))?;
    if !merged.unmatched.is_empty() {
        warn!(
            page = page.index,
            dropped = merged.unmatched.len(),
            "documents without warehouse rows dropped"
        );
    }
    Ok(PageResult {
        index: page.index,
        fetched,
        merged,
    })
}

/// Wires the configured Solr, Redshift and loader for `store` and runs one export.
pub async fn run_feed_from_config(config: &FeedConfig, store: &str) -> Result<FeedRunSummary> {
    let store_config = config.store(store)?;
    let settings = &config.pipeline;
    let http = Arc::new(HttpFetcher::new(config.http.client_config())?);

    let index = Arc::new(SolrIndexReader::new(
        store,
        store_config.index.clone(),
        http.clone(),
    ));
    let query_template = read_text_file(&config.warehouse_query_path).await?;
    let warehouse = Arc::new(
        RedshiftSource::connect(
            &store_config.warehouse,
            settings.pool_settings(),
            query_template,
        )
        .with_key_column(&store_config.index.id_field),
    );

    let staging = settings.staging_dir.clone().map(StagingStore::new);
    let loader: Arc<dyn BulkLoader> = if settings.local_only {
        let staging = staging.unwrap_or_else(|| StagingStore::new(DEFAULT_STAGING_DIR));
        Arc::new(LocalOnlyLoader::new(staging))
    } else {
        let gcp = config.gcp()?;
        let key_path = gcp.key_path()?;
        let objects = GcsObjectStore::from_key_path(http.clone(), key_path)
            .await
            .context("authenticating object storage client")?;
        let bigquery = BigQueryWarehouse::from_key_path(
            key_path,
            Duration::from_secs(settings.job_poll_interval_secs.max(1)),
        )
        .await
        .context("authenticating bigquery client")?;
        let target = CloudTarget {
            project_id: gcp.project_id.clone(),
            bucket: gcp.storage.bucket.clone(),
            blob: gcp.storage.blob.clone(),
            table: TableRef::new(&gcp.project_id, &gcp.bigquery.dataset, &gcp.bigquery.table),
        };
        let loader = GcsBigQueryLoader::new(Arc::new(objects), Arc::new(bigquery), target);
        Arc::new(match staging {
            Some(staging) => loader.with_local_copy(staging),
            None => loader,
        })
    };

    let options = PipelineOptions {
        page_size: settings.page_size,
        max_in_flight_pages: settings.max_in_flight_pages,
        id_field: store_config.index.id_field.clone(),
        output_format: settings.output_format,
        unmatched: settings.unmatched,
    };
    FeedPipeline::new(store, options, index, warehouse, loader)
        .run_once()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use stockfeed_core::{Document, EncodedPayload, WarehouseRow};
    use stockfeed_sources::SourceError;

    fn object(value: Value) -> serde_json::Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    /// Serves `sku-0..sku-{total}`; tracks how many page reads overlap.
    struct FakeIndex {
        total: u64,
        fail_page: Option<usize>,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeIndex {
        fn new(total: u64) -> Self {
            Self {
                total,
                fail_page: None,
                delay: Duration::from_millis(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl IndexReader for FakeIndex {
        fn store(&self) -> &str {
            "dafiti"
        }

        async fn count(&self) -> Result<u64, SourceError> {
            Ok(self.total)
        }

        async fn read_page(&self, page: &PageRequest) -> Result<Vec<Document>, SourceError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail_page == Some(page.index) {
                return Err(SourceError::Url(format!("page {} unavailable", page.index)));
            }
            let end = (page.offset + page.size).min(self.total);
            Ok((page.offset..end)
                .map(|i| Document::new(object(json!({"sku": format!("sku-{i}"), "name": "n"}))))
                .collect())
        }
    }

    /// Has rows for every identifier except those ending in `skip_suffix`.
    struct FakeWarehouse {
        skip_suffix: &'static str,
        closed: AtomicBool,
        lookups: Mutex<Vec<usize>>,
    }

    impl FakeWarehouse {
        fn new(skip_suffix: &'static str) -> Self {
            Self {
                skip_suffix,
                closed: AtomicBool::new(false),
                lookups: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl WarehouseSource for FakeWarehouse {
        async fn fetch_rows(
            &self,
            page_index: usize,
            ids: &[String],
        ) -> Result<HashMap<String, WarehouseRow>, SourceError> {
            self.lookups.lock().unwrap().push(page_index);
            Ok(ids
                .iter()
                .filter(|id| self.skip_suffix.is_empty() || !id.ends_with(self.skip_suffix))
                .map(|id| {
                    (
                        id.clone(),
                        WarehouseRow::new(object(json!({"sku": id, "stock": 3}))),
                    )
                })
                .collect())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CapturingLoader {
        payloads: Mutex<Vec<EncodedPayload>>,
    }

    #[async_trait]
    impl BulkLoader for CapturingLoader {
        async fn load(&self, _store: &str, payload: &EncodedPayload) -> Result<LoadReport> {
            self.payloads.lock().unwrap().push(payload.clone());
            Ok(LoadReport {
                raw_bytes: payload.bytes.len(),
                ..Default::default()
            })
        }
    }

    fn options(page_size: u64, max_in_flight_pages: usize) -> PipelineOptions {
        PipelineOptions {
            page_size,
            max_in_flight_pages,
            id_field: "sku".into(),
            output_format: OutputFormat::Ndjson,
            unmatched: UnmatchedPolicy::Drop,
        }
    }

    fn pipeline(
        options: PipelineOptions,
        index: Arc<FakeIndex>,
        warehouse: Arc<FakeWarehouse>,
        loader: Arc<CapturingLoader>,
    ) -> FeedPipeline {
        FeedPipeline::new("dafiti", options, index, warehouse, loader)
    }

    fn loaded_skus(loader: &CapturingLoader) -> Vec<String> {
        let payloads = loader.payloads.lock().unwrap();
        let mut skus: Vec<String> = String::from_utf8(payloads[0].bytes.clone())
            .unwrap()
            .lines()
            .map(|line| {
                let value: Value = serde_json::from_str(line).unwrap();
                assert_eq!(value["stock"], 3);
                value["sku"].as_str().unwrap().to_string()
            })
            .collect();
        skus.sort();
        skus
    }

    #[tokio::test]
    async fn merges_all_pages_drops_unmatched_and_loads_once() {
        let index = Arc::new(FakeIndex::new(7));
        let warehouse = Arc::new(FakeWarehouse::new("-3"));
        let loader = Arc::new(CapturingLoader::default());

        let summary = pipeline(options(3, 2), index, warehouse.clone(), loader.clone())
            .run_once()
            .await
            .unwrap();

        assert_eq!(summary.total_documents, 7);
        assert_eq!(summary.pages_planned, 3);
        assert_eq!(summary.documents_fetched, 7);
        assert_eq!(summary.records_merged, 6);
        assert_eq!(summary.documents_dropped, 1);
        assert_eq!(loader.payloads.lock().unwrap().len(), 1);
        assert_eq!(
            loaded_skus(&loader),
            vec!["sku-0", "sku-1", "sku-2", "sku-4", "sku-5", "sku-6"]
        );
        let mut lookups = warehouse.lookups.lock().unwrap().clone();
        lookups.sort();
        assert_eq!(lookups, vec![0, 1, 2]);
        assert!(warehouse.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn page_units_never_exceed_in_flight_limit() {
        let mut index = FakeIndex::new(40);
        index.delay = Duration::from_millis(20);
        let index = Arc::new(index);
        let loader = Arc::new(CapturingLoader::default());

        let summary = pipeline(
            options(4, 3),
            index.clone(),
            Arc::new(FakeWarehouse::new("")),
            loader,
        )
        .run_once()
        .await
        .unwrap();

        assert_eq!(summary.pages_planned, 10);
        assert_eq!(summary.records_merged, 40);
        let observed = index.max_in_flight.load(Ordering::SeqCst);
        assert!(observed >= 1 && observed <= 3, "observed {observed} concurrent pages");
    }

    #[tokio::test]
    async fn failing_page_fails_run_and_still_closes_warehouse() {
        let mut index = FakeIndex::new(9);
        index.fail_page = Some(1);
        let warehouse = Arc::new(FakeWarehouse::new(""));
        let loader = Arc::new(CapturingLoader::default());

        let err = pipeline(options(3, 3), Arc::new(index), warehouse.clone(), loader.clone())
            .run_once()
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("page 1 unavailable"));
        assert!(warehouse.closed.load(Ordering::SeqCst));
        assert!(loader.payloads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fail_policy_rejects_unmatched_documents() {
        let mut opts = options(5, 2);
        opts.unmatched = UnmatchedPolicy::Fail;
        let warehouse = Arc::new(FakeWarehouse::new("-2"));
        let loader = Arc::new(CapturingLoader::default());

        let err = pipeline(opts, Arc::new(FakeIndex::new(5)), warehouse.clone(), loader.clone())
            .run_once()
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("sku-2"));
        assert!(warehouse.closed.load(Ordering::SeqCst));
        assert!(loader.payloads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_index_plans_nothing_and_skips_load() {
        let warehouse = Arc::new(FakeWarehouse::new(""));
        let loader = Arc::new(CapturingLoader::default());

        let summary = pipeline(options(10, 2), Arc::new(FakeIndex::new(0)), warehouse.clone(), loader.clone())
            .run_once()
            .await
            .unwrap();

        assert_eq!(summary.pages_planned, 0);
        assert!(summary.load.is_none());
        assert!(loader.payloads.lock().unwrap().is_empty());
        assert!(warehouse.lookups.lock().unwrap().is_empty());
        assert!(warehouse.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn csv_output_carries_header_and_rows() {
        let mut opts = options(10, 1);
        opts.output_format = OutputFormat::Csv;
        let loader = Arc::new(CapturingLoader::default());

        pipeline(opts, Arc::new(FakeIndex::new(2)), Arc::new(FakeWarehouse::new("")), loader.clone())
            .run_once()
            .await
            .unwrap();

        let payloads = loader.payloads.lock().unwrap();
        assert_eq!(payloads[0].format, OutputFormat::Csv);
        let text = String::from_utf8(payloads[0].bytes.clone()).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("sku,name,stock"));
        assert_eq!(lines.count(), 2);
    }
}
