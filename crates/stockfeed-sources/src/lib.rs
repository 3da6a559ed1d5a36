//! Source contracts for the stock feed: the document index and the relational warehouse.

use std::collections::HashMap;

use async_trait::async_trait;
use stockfeed_core::{Document, PageRequest, TemplateError, WarehouseRow};
use stockfeed_storage::FetchError;
use thiserror::Error;

pub mod redshift;
pub mod solr;

pub use redshift::{LookupSlots, PoolSettings, RedshiftSource, WarehouseConnection};
pub use solr::{decode_select_response, IndexEndpoint, SelectResponse, SolrIndexReader};

pub const CRATE_NAME: &str = "stockfeed-sources";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed index response from {url}: {source}")]
    MalformedResponse {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid index url: {0}")]
    Url(String),
    #[error("rendering warehouse query: {0}")]
    Template(#[from] TemplateError),
    #[error("warehouse query failed: {0}")]
    Query(#[from] sqlx::Error),
}

/// Paginated reads against the document index.
#[async_trait]
pub trait IndexReader: Send + Sync {
    fn store(&self) -> &str;

    /// Total number of documents matched by the configured query.
    async fn count(&self) -> Result<u64, SourceError>;

    /// Documents of one page, in index order.
    async fn read_page(&self, page: &PageRequest) -> Result<Vec<Document>, SourceError>;
}

/// Per-page lookups against the relational warehouse.
#[async_trait]
pub trait WarehouseSource: Send + Sync {
    /// Rows for `ids`, keyed by identifier. Identifiers without a row are simply absent.
    async fn fetch_rows(
        &self,
        page_index: usize,
        ids: &[String],
    ) -> Result<HashMap<String, WarehouseRow>, SourceError>;

    /// Releases pooled connections. Called once per run, on success and on failure.
    async fn close(&self) {}
}
