//! Object storage staging for bulk loads (Google Cloud Storage JSON API).

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use gcp_bigquery_client::yup_oauth2::authenticator::DefaultAuthenticator;
use gcp_bigquery_client::yup_oauth2::{parse_service_account_key, ServiceAccountAuthenticator};
use reqwest::Url;
use thiserror::Error;
use tracing::info;

use crate::{FetchError, HttpFetcher};

const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";
const DEFAULT_UPLOAD_BASE: &str = "https://storage.googleapis.com";

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("obtaining storage access token: {0}")]
    Token(#[from] gcp_bigquery_client::yup_oauth2::Error),
    #[error("token response carried no access token")]
    NoToken,
    #[error("loading service account key: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid upload url: {0}")]
    Url(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Bearer tokens for the storage API.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String, ObjectStoreError>;
}

/// Service-account OAuth tokens scoped to read/write object storage.
pub struct ServiceAccountTokens {
    auth: DefaultAuthenticator,
}

impl ServiceAccountTokens {
    pub async fn from_key_path(key_path: impl AsRef<Path>) -> Result<Self, ObjectStoreError> {
        let key = tokio::fs::read_to_string(key_path.as_ref()).await?;
        let key = parse_service_account_key(key)?;
        let auth = ServiceAccountAuthenticator::builder(key).build().await?;
        Ok(Self { auth })
    }
}

#[async_trait]
impl AccessTokenSource for ServiceAccountTokens {
    async fn access_token(&self) -> Result<String, ObjectStoreError> {
        let token = self.auth.token(&[STORAGE_SCOPE]).await?;
        token
            .token()
            .map(str::to_string)
            .ok_or(ObjectStoreError::NoToken)
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Uploads `bytes` as `bucket/name` and returns its `gs://` URI.
    async fn upload(
        &self,
        bucket: &str,
        name: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<String, ObjectStoreError>;
}

pub struct GcsObjectStore {
    http: Arc<HttpFetcher>,
    tokens: Arc<dyn AccessTokenSource>,
    upload_base: String,
}

impl GcsObjectStore {
    pub fn new(http: Arc<HttpFetcher>, tokens: Arc<dyn AccessTokenSource>) -> Self {
        Self {
            http,
            tokens,
            upload_base: DEFAULT_UPLOAD_BASE.to_string(),
        }
    }

    pub async fn from_key_path(
        http: Arc<HttpFetcher>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, ObjectStoreError> {
        let tokens = ServiceAccountTokens::from_key_path(key_path).await?;
        Ok(Self::new(http, Arc::new(tokens)))
    }

    pub fn with_upload_base(mut self, upload_base: impl Into<String>) -> Self {
        self.upload_base = upload_base.into();
        self
    }

    pub fn upload_url(&self, bucket: &str, name: &str) -> Result<Url, ObjectStoreError> {
        media_upload_url(&self.upload_base, bucket, name)
    }
}

/// `<base>/upload/storage/v1/b/<bucket>/o?uploadType=media&name=<name>`
pub fn media_upload_url(base: &str, bucket: &str, name: &str) -> Result<Url, ObjectStoreError> {
    let endpoint = format!("{}/upload/storage/v1/b/{}/o", base.trim_end_matches('/'), bucket);
    let mut url =
        Url::parse(&endpoint).map_err(|err| ObjectStoreError::Url(format!("{endpoint}: {err}")))?;
    url.query_pairs_mut()
        .append_pair("uploadType", "media")
        .append_pair("name", name);
    Ok(url)
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    async fn upload(
        &self,
        bucket: &str,
        name: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<String, ObjectStoreError> {
        let url = self.upload_url(bucket, name)?;
        let token = self.tokens.access_token().await?;
        self.http
            .post_bytes("gcs", url.as_str(), Some(&token), content_type, bytes)
            .await?;
        let uri = format!("gs://{bucket}/{name}");
        info!(%uri, bytes = bytes.len(), "uploaded staged payload");
        Ok(uri)
    }
}
