//! Staging storage, shared HTTP fetcher and cloud clients for the stock feed.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub mod object_store;
pub mod warehouse;

pub use object_store::{
    AccessTokenSource, GcsObjectStore, ObjectStore, ObjectStoreError, ServiceAccountTokens,
};
pub use warehouse::{
    BigQueryWarehouse, CloudWarehouse, DestinationTable, JobHandle, JobReferenceBody,
    LoadJobRequest, QueryJobBody, QueryJobConfiguration, QueryJobSpec, TableRef, WarehouseError,
    WriteDisposition, MAXIMUM_BYTES_BILLED,
};

pub const CRATE_NAME: &str = "stockfeed-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn compress_gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 4), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

/// Reads a whole text file (query templates, fixtures) without blocking the runtime.
pub async fn read_text_file(path: impl AsRef<Path>) -> anyhow::Result<String> {
    let path = path.as_ref();
    fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct StagedFile {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub raw_bytes: usize,
    pub compressed: Vec<u8>,
    pub reused: bool,
}

/// Local, hash-addressed copies of gzip payloads handed to the bulk loader.
#[derive(Debug, Clone)]
pub struct StagingStore {
    root: PathBuf,
}

impl StagingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<store>/<YYYYMMDD>/<HHMMSS>-<hash prefix>.<format ext>.gz`
    pub fn staged_relative_path(
        &self,
        staged_at: DateTime<Utc>,
        store: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        let short_hash = &content_hash[..content_hash.len().min(16)];
        PathBuf::from(store)
            .join(staged_at.format("%Y%m%d").to_string())
            .join(format!("{}-{short_hash}.{ext}.gz", staged_at.format("%H%M%S")))
    }

    /// Compresses `raw` and writes it under the store's directory. Identical content staged
    /// within the same second resolves to the same path and is not rewritten.
    pub async fn stage(
        &self,
        staged_at: DateTime<Utc>,
        store: &str,
        extension: &str,
        raw: &[u8],
    ) -> anyhow::Result<StagedFile> {
        let content_hash = sha256_hex(raw);
        let compressed = compress_gzip(raw).context("gzip-compressing staged payload")?;
        let relative_path = self.staged_relative_path(staged_at, store, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let written = write_atomic(&absolute_path, &compressed).await?;

        Ok(StagedFile {
            content_hash,
            relative_path,
            absolute_path,
            raw_bytes: raw.len(),
            compressed,
            reused: !written,
        })
    }
}

/// Writes through a temp file + rename. Returns `false` when the target already existed.
async fn write_atomic(target: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let parent = target
        .parent()
        .with_context(|| format!("staging path {} has no parent", target.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating staging directory {}", parent.display()))?;

    if fs::try_exists(target)
        .await
        .with_context(|| format!("checking staging path {}", target.display()))?
    {
        return Ok(false);
    }

    let temp_path = parent.join(format!(".{}.partial", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening {}", temp_path.display()))?;
    let write_result = async {
        file.write_all(bytes).await?;
        file.flush().await
    }
    .await;
    drop(file);
    if let Err(err) = write_result {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("writing {}", temp_path.display()));
    }

    match fs::rename(&temp_path, target).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = fs::remove_file(&temp_path).await;
            Ok(false)
        }
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!("renaming {} -> {}", temp_path.display(), target.display())
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_scope_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            global_concurrency: 32,
            per_scope_concurrency: 16,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("request limiter closed")]
    LimiterClosed,
}

/// HTTP client shared by the index reader, the object store and the task queue.
///
/// Requests are bounded globally and per scope (one scope per index host or service),
/// and retried with exponential backoff on 5xx/429 and transient transport errors.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_scope_limit: usize,
    per_scope: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_scope_limit: config.per_scope_concurrency.max(1),
            per_scope: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn scope_semaphore(&self, scope: &str) -> Arc<Semaphore> {
        let mut map = self.per_scope.lock().await;
        map.entry(scope.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_scope_limit)))
            .clone()
    }

    pub async fn fetch_bytes(&self, scope: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        self.execute(scope, |client| client.get(url))
            .instrument(info_span!("http_fetch", scope, method = "GET", url))
            .await
    }

    pub async fn post_form(
        &self,
        scope: &str,
        url: &str,
        params: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        self.execute(scope, |client| client.post(url).form(params))
            .instrument(info_span!("http_fetch", scope, method = "POST", url))
            .await
    }

    pub async fn post_bytes(
        &self,
        scope: &str,
        url: &str,
        bearer_token: Option<&str>,
        content_type: &str,
        body: &[u8],
    ) -> Result<FetchedResponse, FetchError> {
        self.execute(scope, |client| {
            let request = client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(body.to_vec());
            match bearer_token {
                Some(token) => request.bearer_auth(token),
                None => request,
            }
        })
        .instrument(info_span!("http_fetch", scope, method = "POST", url, bytes = body.len()))
        .await
    }

    async fn execute<F>(&self, scope: &str, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;
        let scoped = self.scope_semaphore(scope).await;
        let _scoped = scoped.acquire().await.map_err(|_| FetchError::LimiterClosed)?;

        let mut attempt = 0usize;
        loop {
            match build(&self.client).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%status, attempt, "retryable http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body: body.chars().take(512).collect(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retryable transport error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::tempdir;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn reading_a_fixture_returns_exact_content() {
        let text = read_text_file(workspace_root().join("fixtures/files/test.csv"))
            .await
            .expect("read fixture");
        assert_eq!(text, "read test\n");
    }

    #[tokio::test]
    async fn staging_compresses_and_reuses_identical_payloads() {
        let dir = tempdir().expect("tempdir");
        let store = StagingStore::new(dir.path());
        let staged_at = Utc.with_ymd_and_hms(2017, 10, 10, 6, 30, 0).single().expect("ts");
        let payload = b"{\"sku\":\"A\"}\n{\"sku\":\"B\"}\n";

        let first = store.stage(staged_at, "dafiti", "json", payload).await.expect("first");
        let second = store.stage(staged_at, "dafiti", "json", payload).await.expect("second");

        assert!(!first.reused);
        assert!(second.reused);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("dafiti/20171010"));
        assert!(first.relative_path.to_string_lossy().ends_with(".json.gz"));
        assert_eq!(first.raw_bytes, payload.len());

        let on_disk = std::fs::read(&first.absolute_path).expect("read staged");
        let mut decoded = String::new();
        GzDecoder::new(on_disk.as_slice())
            .read_to_string(&mut decoded)
            .expect("gunzip");
        assert_eq!(decoded.as_bytes(), payload);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    fn quick_retries(max_retries: usize) -> HttpClientConfig {
        HttpClientConfig {
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
            },
            ..Default::default()
        }
    }

    /// Serves `503` for the first `failures` requests, then `200 ok`.
    async fn spawn_flaky(failures: usize) -> (String, Arc<std::sync::atomic::AtomicUsize>) {
        use axum::http::StatusCode as AxumStatus;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = axum::Router::new().route(
            "/select",
            axum::routing::get(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < failures {
                        (AxumStatus::SERVICE_UNAVAILABLE, "warming up")
                    } else {
                        (AxumStatus::OK, "ok")
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        (format!("http://{addr}/select"), hits)
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_success() {
        let (url, hits) = spawn_flaky(2).await;
        let fetcher = HttpFetcher::new(quick_retries(3)).expect("fetcher");

        let response = fetcher.fetch_bytes("solr", &url).await.expect("fetch");

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, b"ok");
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_give_up_with_the_last_status() {
        let (url, hits) = spawn_flaky(usize::MAX).await;
        let fetcher = HttpFetcher::new(quick_retries(2)).expect("fetcher");

        let err = fetcher.fetch_bytes("solr", &url).await.unwrap_err();

        match err {
            FetchError::HttpStatus { status, body, .. } => {
                assert_eq!(status, 503);
                assert_eq!(body, "warming up");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn refused_connection_fails_after_retries() {
        let fetcher = HttpFetcher::new(quick_retries(1)).expect("fetcher");
        let err = fetcher
            .post_form("worker", "http://127.0.0.1:1/task", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Request(_)));
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }
}
