//! Core domain model for the stock feed: index documents, warehouse rows, pages and the merge.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const CRATE_NAME: &str = "stockfeed-core";

/// Identifier field shared by index documents and warehouse rows unless configured otherwise.
pub const DEFAULT_ID_FIELD: &str = "sku";

/// One document returned by the search index.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn id(&self, id_field: &str) -> Option<String> {
        self.fields.get(id_field).and_then(identifier_text)
    }
}

/// One row returned by the relational warehouse, keyed by the same identifier as [`Document`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WarehouseRow {
    pub columns: Map<String, Value>,
}

impl WarehouseRow {
    pub fn new(columns: Map<String, Value>) -> Self {
        Self { columns }
    }

    pub fn id(&self, id_field: &str) -> Option<String> {
        self.columns.get(id_field).and_then(identifier_text)
    }
}

/// Document fields overlaid with warehouse columns. Warehouse values win on collision.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MergedRecord {
    pub fields: Map<String, Value>,
}

impl MergedRecord {
    pub fn from_parts(document: Document, row: &WarehouseRow) -> Self {
        let mut fields = document.fields;
        for (column, value) in &row.columns {
            fields.insert(column.clone(), value.clone());
        }
        Self { fields }
    }

    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(&self.fields)?;
        line.push('\n');
        Ok(line)
    }
}

fn identifier_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Bounded slice of the index result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub index: usize,
    pub offset: u64,
    pub size: u64,
}

/// A fetched page: the request plus the documents it returned, in index order.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub request: PageRequest,
    pub documents: Vec<Document>,
}

/// Splits `total` matches into `ceil(total / page_size)` contiguous pages.
pub fn plan_pages(total: u64, page_size: u64) -> Vec<PageRequest> {
    let page_size = page_size.max(1);
    let pages = total.div_ceil(page_size);
    (0..pages)
        .map(|i| PageRequest {
            index: i as usize,
            offset: i * page_size,
            size: page_size,
        })
        .collect()
}

/// What to do with an index document that has no warehouse row in its page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnmatchedPolicy {
    #[default]
    Drop,
    Fail,
}

impl FromStr for UnmatchedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "fail" => Ok(Self::Fail),
            other => Err(format!("unknown unmatched policy `{other}` (expected drop|fail)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Ndjson,
    Csv,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Ndjson => "json",
            Self::Csv => "csv",
        }
    }

    /// Source format name understood by BigQuery load jobs.
    pub fn load_source_format(&self) -> &'static str {
        match self {
            Self::Ndjson => "NEWLINE_DELIMITED_JSON",
            Self::Csv => "CSV",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ndjson => f.write_str("ndjson"),
            Self::Csv => f.write_str("csv"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ndjson" | "json" | "jsonl" => Ok(Self::Ndjson),
            "csv" => Ok(Self::Csv),
            other => Err(format!("unknown output format `{other}` (expected ndjson|csv)")),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("document at position {position} has no `{id_field}` identifier")]
    MissingIdentifier { position: usize, id_field: String },
    #[error("no warehouse row for identifier `{id}`")]
    Unmatched { id: String },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MergeOutcome {
    pub records: Vec<MergedRecord>,
    pub unmatched: Vec<String>,
}

/// Identifiers of a page's documents, in index order.
pub fn document_ids(documents: &[Document], id_field: &str) -> Result<Vec<String>, MergeError> {
    documents
        .iter()
        .enumerate()
        .map(|(position, doc)| {
            doc.id(id_field).ok_or_else(|| MergeError::MissingIdentifier {
                position,
                id_field: id_field.to_string(),
            })
        })
        .collect()
}

/// Inner join of one page's documents with the warehouse rows fetched for it.
pub fn merge_page(
    documents: Vec<Document>,
    rows: &HashMap<String, WarehouseRow>,
    id_field: &str,
    policy: UnmatchedPolicy,
) -> Result<MergeOutcome, MergeError> {
    let mut outcome = MergeOutcome {
        records: Vec::with_capacity(documents.len()),
        unmatched: Vec::new(),
    };

    for (position, document) in documents.into_iter().enumerate() {
        let id = document.id(id_field).ok_or_else(|| MergeError::MissingIdentifier {
            position,
            id_field: id_field.to_string(),
        })?;
        match rows.get(&id) {
            Some(row) => outcome.records.push(MergedRecord::from_parts(document, row)),
            None if policy == UnmatchedPolicy::Fail => return Err(MergeError::Unmatched { id }),
            None => outcome.unmatched.push(id),
        }
    }

    Ok(outcome)
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("encoding record as json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("encoding record as csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("flushing csv buffer: {0}")]
    Io(#[from] std::io::Error),
}

/// Serialized bulk payload handed to the loader.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedPayload {
    pub format: OutputFormat,
    pub records: usize,
    pub bytes: Vec<u8>,
}

pub fn encode_records(
    format: OutputFormat,
    records: &[MergedRecord],
) -> Result<EncodedPayload, EncodeError> {
    let bytes = match format {
        OutputFormat::Ndjson => encode_ndjson(records)?,
        OutputFormat::Csv => encode_csv(records)?,
    };
    Ok(EncodedPayload {
        format,
        records: records.len(),
        bytes,
    })
}

fn encode_ndjson(records: &[MergedRecord]) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::new();
    for record in records {
        out.extend_from_slice(record.to_json_line()?.as_bytes());
    }
    Ok(out)
}

/// CSV with a header built from the union of all record fields in first-seen order.
fn encode_csv(records: &[MergedRecord]) -> Result<Vec<u8>, EncodeError> {
    let mut columns: Vec<&str> = Vec::new();
    for record in records {
        for key in record.fields.keys() {
            if !columns.contains(&key.as_str()) {
                columns.push(key.as_str());
            }
        }
    }

    let mut writer = csv::Writer::from_writer(Vec::new());
    if !columns.is_empty() {
        writer.write_record(&columns)?;
    }
    for record in records {
        let row = columns
            .iter()
            .map(|column| csv_cell(record.fields.get(*column)))
            .collect::<Vec<_>>();
        writer.write_record(&row)?;
    }
    writer.into_inner().map_err(|err| EncodeError::Io(err.into_error()))
}

fn csv_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(nested) => nested.to_string(),
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("no value for placeholder `{{{0}}}`")]
    UnknownPlaceholder(String),
    #[error("unclosed placeholder starting at byte {0}")]
    Unclosed(usize),
}

/// Substitutes `{name}` placeholders from `values`. `{{` and `}}` are literal braces.
pub fn render_template(
    template: &str,
    values: &BTreeMap<&str, String>,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut consumed = 0usize;

    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with("{{") || tail.starts_with("}}") {
            out.push_str(&tail[..1]);
            rest = &tail[2..];
            consumed += pos + 2;
            continue;
        }
        if tail.starts_with('}') {
            out.push('}');
            rest = &tail[1..];
            consumed += pos + 1;
            continue;
        }
        let close = tail.find('}').ok_or(TemplateError::Unclosed(consumed + pos))?;
        let name = tail[1..close].trim();
        let value = values
            .get(name)
            .ok_or_else(|| TemplateError::UnknownPlaceholder(name.to_string()))?;
        out.push_str(value);
        rest = &tail[close + 1..];
        consumed += pos + close + 1;
    }
    out.push_str(rest);
    Ok(out)
}
