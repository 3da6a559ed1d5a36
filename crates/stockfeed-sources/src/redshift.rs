//! Relational warehouse lookups over the Postgres wire protocol (Redshift speaks it).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use pg_escape::quote_literal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::types::BigDecimal;
use sqlx::{Column, PgPool, Row, TypeInfo};
use stockfeed_core::{render_template, TemplateError, WarehouseRow, DEFAULT_ID_FIELD};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};

use crate::{SourceError, WarehouseSource};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseConnection {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub dbname: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
}

fn default_port() -> u16 {
    5439
}

impl WarehouseConnection {
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.dbname)
            .username(&self.user)
            .password(&self.password)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: u32,
    /// Bounds connection setup only; lookups queue on [`LookupSlots`] without a deadline.
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 4,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Renders the lookup query. `{ids}` becomes a quoted value list (`('a'),('b')`), `{page}` the page index.
pub fn render_lookup_query(
    template: &str,
    page_index: usize,
    ids: &[String],
) -> Result<String, TemplateError> {
    let values = ids
        .iter()
        .map(|id| format!("({})", quote_literal(id)))
        .collect::<Vec<_>>()
        .join(",");
    let mut params = BTreeMap::new();
    params.insert("ids", values);
    params.insert("page", page_index.to_string());
    render_template(template, &params)
}

/// One slot per pooled connection. A lookup holds a slot for its whole query, so the
/// pool never sees more waiters than it has connections.
#[derive(Debug, Clone)]
pub struct LookupSlots {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl LookupSlots {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Waits for a free slot, however long the lookups ahead of it take.
    pub async fn acquire(&self) -> Result<SemaphorePermit<'_>, SourceError> {
        self.permits
            .acquire()
            .await
            .map_err(|_| SourceError::Query(sqlx::Error::PoolClosed))
    }

    fn close(&self) {
        self.permits.close();
    }
}

pub struct RedshiftSource {
    pool: PgPool,
    slots: LookupSlots,
    query_template: String,
    key_column: String,
}

impl RedshiftSource {
    /// Builds a lazy pool; connections are opened per lookup and never shared across pages.
    pub fn connect(
        connection: &WarehouseConnection,
        settings: PoolSettings,
        query_template: impl Into<String>,
    ) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections.max(1))
            .acquire_timeout(settings.acquire_timeout)
            .connect_lazy_with(connection.connect_options());
        Self::from_pool(pool, query_template)
    }

    pub fn from_pool(pool: PgPool, query_template: impl Into<String>) -> Self {
        let slots = LookupSlots::new(pool.options().get_max_connections() as usize);
        Self {
            pool,
            slots,
            query_template: query_template.into(),
            key_column: DEFAULT_ID_FIELD.to_string(),
        }
    }

    pub fn with_key_column(mut self, key_column: impl Into<String>) -> Self {
        self.key_column = key_column.into();
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn lookup_slots(&self) -> &LookupSlots {
        &self.slots
    }
}

#[async_trait]
impl WarehouseSource for RedshiftSource {
    async fn fetch_rows(
        &self,
        page_index: usize,
        ids: &[String],
    ) -> Result<HashMap<String, WarehouseRow>, SourceError> {
        if ids.is_empty() {
            debug!(page = page_index, "no identifiers on page, skipping lookup");
            return Ok(HashMap::new());
        }

        let sql = render_lookup_query(&self.query_template, page_index, ids)?;
        let rows = {
            let _slot = self.slots.acquire().await?;
            sqlx::query(&sql).fetch_all(&self.pool).await?
        };

        let mut by_id = HashMap::with_capacity(rows.len());
        for row in &rows {
            let row = decode_row(row);
            match row.id(&self.key_column) {
                Some(id) => {
                    by_id.insert(id, row);
                }
                None => warn!(
                    page = page_index,
                    key_column = %self.key_column,
                    "warehouse row without key column"
                ),
            }
        }
        info!(
            page = page_index,
            requested = ids.len(),
            returned = by_id.len(),
            "warehouse lookup finished"
        );
        Ok(by_id)
    }

    async fn close(&self) {
        self.slots.close();
        if !self.pool.is_closed() {
            self.pool.close().await;
            debug!("warehouse pool closed");
        }
    }
}

fn decode_row(row: &PgRow) -> WarehouseRow {
    let mut columns = Map::new();
    for column in row.columns() {
        let value = decode_column(row, column.ordinal(), column.type_info().name());
        columns.insert(column.name().to_string(), value);
    }
    WarehouseRow::new(columns)
}

fn decode_column(row: &PgRow, index: usize, type_name: &str) -> Value {
    fn get<'r, T>(row: &'r PgRow, index: usize) -> Option<T>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
    {
        row.try_get::<Option<T>, _>(index).ok().flatten()
    }

    let value = match type_name {
        "BOOL" => get::<bool>(row, index).map(Value::Bool),
        "INT2" => get::<i16>(row, index).map(Value::from),
        "INT4" => get::<i32>(row, index).map(Value::from),
        "INT8" => get::<i64>(row, index).map(Value::from),
        "FLOAT4" => get::<f32>(row, index).and_then(|v| Number::from_f64(f64::from(v)).map(Value::Number)),
        "FLOAT8" => get::<f64>(row, index).and_then(|v| Number::from_f64(v).map(Value::Number)),
        "NUMERIC" => get::<BigDecimal>(row, index).map(|v| numeric_value(&v)),
        "DATE" => get::<NaiveDate>(row, index).map(|v| Value::String(v.to_string())),
        "TIMESTAMP" => get::<NaiveDateTime>(row, index)
            .map(|v| Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        "TIMESTAMPTZ" => get::<DateTime<Utc>>(row, index).map(|v| Value::String(v.to_rfc3339())),
        "JSON" | "JSONB" => get::<Value>(row, index),
        _ => get::<String>(row, index).map(Value::String),
    };
    value.unwrap_or(Value::Null)
}

/// DECIMAL columns keep every digit, so they travel as strings.
fn numeric_value(value: &BigDecimal) -> Value {
    Value::String(value.to_string())
}
