use std::time::{Duration, Instant};

use futures::TryStreamExt;
use log::{debug, error, info};
use sqlx::{
    any::{AnyPoolOptions, AnyRow},
    AnyPool, Column, Row, ValueRef,
};

use crate::{
    core::{
        block_on,
        record::{Columns, Record, RecordSet, Value},
    },
    item::RecordExtractor,
    BatchError,
};

/// Runs one query against a source database and gathers the whole result set.
///
/// The statement is executed once; rows are pulled from the result stream
/// `fetch_size` at a time so the driver never buffers the full result. The
/// column list is taken from the result metadata, aliases included.
///
/// Any driver compiled into sqlx (`postgres://`, `mysql://`, `sqlite://`) can be
/// used. Values are decoded to [`Value`] without knowing the schema, so the
/// query should project scalar types (dates already formatted as text).
pub struct SqlSourceReader {
    url: String,
    query: String,
    fetch_size: usize,
    progress_every: usize,
    connect_timeout: Duration,
}

impl SqlSourceReader {
    async fn connect(&self) -> Result<AnyPool, BatchError> {
        sqlx::any::install_default_drivers();

        AnyPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(self.connect_timeout)
            .connect(&self.url)
            .await
            .map_err(|e| {
                error!("Unable to connect to the source database: {}", e);
                BatchError::ItemReader(format!("source connection failed: {}", e))
            })
    }

    async fn fetch_all(&self, pool: &AnyPool) -> Result<RecordSet, BatchError> {
        let start = Instant::now();
        let mut columns: Option<Columns> = None;
        let mut records: Vec<Record> = Vec::new();
        let mut next_progress = self.progress_every;

        let mut chunks = sqlx::query(&self.query)
            .fetch(pool)
            .try_chunks(self.fetch_size);

        while let Some(rows) = chunks.try_next().await.map_err(|e| {
            error!("Error while extracting rows: {}", e.1);
            BatchError::ItemReader(format!("source query failed: {}", e.1))
        })? {
            if columns.is_none() {
                columns = rows.first().map(column_names);
            }

            for row in &rows {
                records.push(decode_row(row)?);
            }

            if records.len() >= next_progress {
                let elapsed = start.elapsed().as_secs_f64();
                info!(
                    "  -> Extracted {} rows... ({:.0} rows/s)",
                    records.len(),
                    rate(records.len(), elapsed)
                );
                while next_progress <= records.len() {
                    next_progress += self.progress_every;
                }
            }
        }

        info!(
            "Extraction completed: {} rows in {:.2} seconds",
            records.len(),
            start.elapsed().as_secs_f64()
        );

        let record_set = RecordSet::new(columns.unwrap_or_default(), records);
        record_set.ensure_aligned()?;
        Ok(record_set)
    }
}

impl RecordExtractor for SqlSourceReader {
    fn extract(&self) -> Result<RecordSet, BatchError> {
        info!("Extracting rows from the source database...");
        debug!("Source query: {}", self.query);

        block_on(async {
            let pool = self.connect().await?;
            info!("Connected to the source database");

            let result = self.fetch_all(&pool).await;
            pool.close().await;
            result
        })
    }
}

fn column_names(row: &AnyRow) -> Columns {
    Columns::new(row.columns().iter().map(|column| column.name().to_string()))
}

/// Decodes a row field by field, trying the scalar types sqlx's `Any` driver knows.
fn decode_row(row: &AnyRow) -> Result<Record, BatchError> {
    let mut values = Vec::with_capacity(row.len());

    for index in 0..row.len() {
        values.push(decode_value(row, index)?);
    }

    Ok(Record::new(values))
}

fn decode_value(row: &AnyRow, index: usize) -> Result<Value, BatchError> {
    let raw = row
        .try_get_raw(index)
        .map_err(|e| BatchError::ItemReader(format!("column {}: {}", index, e)))?;

    if raw.is_null() {
        return Ok(Value::Null);
    }

    if let Ok(value) = row.try_get::<bool, _>(index) {
        return Ok(Value::Bool(value));
    }
    if let Ok(value) = row.try_get::<i64, _>(index) {
        return Ok(Value::Int(value));
    }
    if let Ok(value) = row.try_get::<i32, _>(index) {
        return Ok(Value::Int(value.into()));
    }
    if let Ok(value) = row.try_get::<i16, _>(index) {
        return Ok(Value::Int(value.into()));
    }
    if let Ok(value) = row.try_get::<f64, _>(index) {
        return Ok(Value::Float(value));
    }
    if let Ok(value) = row.try_get::<f32, _>(index) {
        return Ok(Value::Float(value.into()));
    }
    if let Ok(value) = row.try_get::<String, _>(index) {
        return Ok(Value::Text(value));
    }
    if let Ok(value) = row.try_get::<Vec<u8>, _>(index) {
        return Ok(Value::Text(String::from_utf8_lossy(&value).into_owned()));
    }

    let name = row
        .columns()
        .get(index)
        .map(|column| column.name().to_string())
        .unwrap_or_default();
    Err(BatchError::ItemReader(format!(
        "unsupported value type in column {}",
        name
    )))
}

pub(crate) fn rate(count: usize, elapsed_secs: f64) -> f64 {
    if elapsed_secs > 0.0 {
        count as f64 / elapsed_secs
    } else {
        0.0
    }
}

pub struct SqlSourceReaderBuilder {
    url: Option<String>,
    query: Option<String>,
    fetch_size: usize,
    progress_every: usize,
    connect_timeout: Duration,
}

impl Default for SqlSourceReaderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlSourceReaderBuilder {
    pub fn new() -> Self {
        Self {
            url: None,
            query: None,
            fetch_size: 1000,
            progress_every: 1000,
            connect_timeout: Duration::from_secs(30),
        }
    }

    pub fn url(mut self, url: &str) -> Self {
        self.url = Some(url.to_string());
        self
    }

    pub fn query(mut self, query: &str) -> Self {
        self.query = Some(query.to_string());
        self
    }

    pub fn fetch_size(mut self, fetch_size: usize) -> Self {
        self.fetch_size = fetch_size;
        self
    }

    /// Rows between two progress lines.
    pub fn progress_every(mut self, progress_every: usize) -> Self {
        self.progress_every = progress_every;
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn build(self) -> Result<SqlSourceReader, BatchError> {
        let url = self
            .url
            .ok_or_else(|| BatchError::Configuration("Source database URL is required".to_string()))?;
        let query = self
            .query
            .ok_or_else(|| BatchError::Configuration("Source query is required".to_string()))?;

        if self.fetch_size == 0 || self.progress_every == 0 {
            return Err(BatchError::Configuration(
                "Fetch size and progress interval must be positive".to_string(),
            ));
        }

        Ok(SqlSourceReader {
            url,
            query,
            fetch_size: self.fetch_size,
            progress_every: self.progress_every,
            connect_timeout: self.connect_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_requires_url_and_query() {
        let missing_url = SqlSourceReaderBuilder::new().query("SELECT 1").build();
        assert!(matches!(missing_url, Err(BatchError::Configuration(_))));

        let missing_query = SqlSourceReaderBuilder::new().url("sqlite::memory:").build();
        assert!(matches!(missing_query, Err(BatchError::Configuration(_))));
    }

    #[test]
    fn zero_fetch_size_is_rejected() {
        let result = SqlSourceReaderBuilder::new()
            .url("sqlite::memory:")
            .query("SELECT 1")
            .fetch_size(0)
            .build();

        assert!(result.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rows_are_gathered_across_chunks_with_column_aliases() {
        let reader = SqlSourceReaderBuilder::new()
            .url("sqlite::memory:")
            .query(
                "WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 7) \
                 SELECT i AS id, 'name' || i AS label, NULL AS nothing FROM n ORDER BY i",
            )
            .fetch_size(3)
            .progress_every(2)
            .build()
            .unwrap();

        let record_set = reader.extract().unwrap();

        assert_eq!(record_set.columns, Columns::new(["id", "label", "nothing"]));
        assert_eq!(record_set.len(), 7);
        assert_eq!(
            record_set.records[6],
            Record::new(vec![Value::Int(7), Value::from("name7"), Value::Null])
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn query_error_is_fatal() {
        let reader = SqlSourceReaderBuilder::new()
            .url("sqlite::memory:")
            .query("SELECT * FROM missing_table")
            .build()
            .unwrap();

        assert!(matches!(reader.extract(), Err(BatchError::ItemReader(_))));
    }
}
