//! Solr select endpoint reader.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use stockfeed_core::{Document, PageRequest, DEFAULT_ID_FIELD};
use stockfeed_storage::HttpFetcher;
use tracing::debug;

use crate::{IndexReader, SourceError};

/// Where and what to read from the index for one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEndpoint {
    /// Core base URL, e.g. `http://solr:8983/solr/dafiti/`.
    pub host: String,
    #[serde(default = "default_query")]
    pub query: String,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default = "default_id_field")]
    pub id_field: String,
}

fn default_query() -> String {
    "*:*".to_string()
}

fn default_id_field() -> String {
    DEFAULT_ID_FIELD.to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct SelectEnvelope {
    response: SelectResponse,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SelectResponse {
    #[serde(rename = "numFound")]
    pub num_found: u64,
    #[serde(default)]
    pub docs: Vec<Document>,
}

pub fn decode_select_response(body: &[u8]) -> Result<SelectResponse, serde_json::Error> {
    serde_json::from_slice::<SelectEnvelope>(body).map(|envelope| envelope.response)
}

pub struct SolrIndexReader {
    store: String,
    endpoint: IndexEndpoint,
    http: Arc<HttpFetcher>,
}

impl SolrIndexReader {
    pub fn new(store: impl Into<String>, endpoint: IndexEndpoint, http: Arc<HttpFetcher>) -> Self {
        Self {
            store: store.into(),
            endpoint,
            http,
        }
    }

    pub fn endpoint(&self) -> &IndexEndpoint {
        &self.endpoint
    }

    /// `select?q=..&start=..&rows=..&wt=json[&fl=..]`; the field list is skipped for count probes.
    pub fn select_url(&self, start: u64, rows: u64) -> Result<Url, SourceError> {
        let host = self.endpoint.host.trim_end_matches('/');
        let base = format!("{host}/select");
        let mut url = Url::parse(&base).map_err(|err| SourceError::Url(format!("{base}: {err}")))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("q", &self.endpoint.query)
                .append_pair("start", &start.to_string())
                .append_pair("rows", &rows.to_string())
                .append_pair("wt", "json");
            if rows > 0 && !self.endpoint.fields.is_empty() {
                pairs.append_pair("fl", &self.endpoint.fields.join(","));
            }
        }
        Ok(url)
    }

    async fn select(&self, start: u64, rows: u64) -> Result<SelectResponse, SourceError> {
        let url = self.select_url(start, rows)?;
        let response = self.http.fetch_bytes(&self.store, url.as_str()).await?;
        decode_select_response(&response.body).map_err(|source| SourceError::MalformedResponse {
            url: response.final_url,
            source,
        })
    }
}

#[async_trait]
impl IndexReader for SolrIndexReader {
    fn store(&self) -> &str {
        &self.store
    }

    async fn count(&self) -> Result<u64, SourceError> {
        let response = self.select(0, 0).await?;
        debug!(store = %self.store, total = response.num_found, "index count");
        Ok(response.num_found)
    }

    async fn read_page(&self, page: &PageRequest) -> Result<Vec<Document>, SourceError> {
        let response = self.select(page.offset, page.size).await?;
        debug!(
            store = %self.store,
            page = page.index,
            docs = response.docs.len(),
            "index page read"
        );
        Ok(response.docs)
    }
}
