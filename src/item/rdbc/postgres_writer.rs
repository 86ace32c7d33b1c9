use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    time::Instant,
};

use log::{debug, error, info, warn};
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::{
    core::{
        block_on,
        item::{ItemWriter, ItemWriterResult},
        record::{Columns, Record},
    },
    item::rdbc::{quote_column, source_reader::rate},
    BatchError,
};

// The number of parameters in databases must fit in a reasonable limit
const BIND_LIMIT: usize = 65535;

/// Full-refresh loader for one destination table.
///
/// - `open` truncates the table (identity reset, cascading) and resolves the
///   destination type of every column.
/// - each `write` call is one transaction: the chunk is inserted with multi-row
///   `INSERT` statements and committed. A failing chunk is rolled back; chunks
///   committed before it stay in the table.
/// - `close` counts the rows of the table, see [`PostgresTableWriter::verified_count`].
///
/// Values are bound as text and cast to the destination column type, so the
/// same record shape loads into `integer`, `date`, `boolean` or `varchar` columns.
///
/// The pool belongs to the caller and is expected to hold a single connection
/// with the `search_path` already set.
pub struct PostgresTableWriter<'a> {
    pool: &'a PgPool,
    table: String,
    columns: Columns,
    column_types: RefCell<Vec<String>>,
    expected_rows: Option<usize>,
    progress_every: usize,
    written: Cell<usize>,
    next_progress: Cell<usize>,
    started: Cell<Option<Instant>>,
    verified_count: Cell<Option<i64>>,
}

impl<'a> PostgresTableWriter<'a> {
    /// `table` is used as written in SQL, e.g. `nimbi."05_beneficios_alumnos"`.
    pub fn new(pool: &'a PgPool, table: &str, columns: Columns) -> Self {
        Self {
            pool,
            table: table.to_string(),
            columns,
            column_types: RefCell::new(Vec::new()),
            expected_rows: None,
            progress_every: 1000,
            written: Cell::new(0),
            next_progress: Cell::new(1000),
            started: Cell::new(None),
            verified_count: Cell::new(None),
        }
    }

    /// Total number of rows the job is about to load, used for the progress percentage.
    pub fn expected_rows(mut self, expected_rows: usize) -> Self {
        self.expected_rows = Some(expected_rows);
        self
    }

    pub fn progress_every(mut self, progress_every: usize) -> Self {
        self.progress_every = progress_every.max(1);
        self.next_progress = Cell::new(self.progress_every);
        self
    }

    /// Rows committed so far.
    pub fn written(&self) -> usize {
        self.written.get()
    }

    /// Row count of the destination table after the last chunk, set by `close`.
    pub fn verified_count(&self) -> Option<i64> {
        self.verified_count.get()
    }

    async fn truncate(&self) -> Result<(), sqlx::Error> {
        let statement = format!("TRUNCATE TABLE {} RESTART IDENTITY CASCADE", self.table);
        sqlx::query(&statement).execute(self.pool).await?;
        Ok(())
    }

    async fn destination_types(&self) -> Result<HashMap<String, String>, sqlx::Error> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT a.attname::text, t.typname::text, format_type(a.atttypid, a.atttypmod) \
             FROM pg_attribute a \
             JOIN pg_type t ON t.oid = a.atttypid \
             WHERE a.attrelid = $1::regclass AND a.attnum > 0 AND NOT a.attisdropped",
        )
        .bind(&self.table)
        .fetch_all(self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(column, type_name, declared)| (column, insert_cast(&type_name, &declared)))
            .collect())
    }

    fn resolve_types(&self, destination: &HashMap<String, String>) -> Result<Vec<String>, BatchError> {
        self.columns
            .names()
            .iter()
            .map(|column| {
                destination
                    .get(column)
                    .or_else(|| destination.get(&column.to_lowercase()))
                    .cloned()
                    .ok_or_else(|| {
                        BatchError::ItemWriter(format!(
                            "column {} does not exist in table {}",
                            column, self.table
                        ))
                    })
            })
            .collect()
    }

    async fn insert_chunk(&self, items: &[Record]) -> Result<(), sqlx::Error> {
        let column_types = self.column_types.borrow().clone();
        let rows_per_statement = (BIND_LIMIT / self.columns.len().max(1)).max(1);

        let mut tx = self.pool.begin().await?;

        for slice in items.chunks(rows_per_statement) {
            let mut query_builder = build_insert(&self.table, &self.columns, &column_types, slice);

            if let Err(e) = query_builder.build().execute(&mut *tx).await {
                if let Err(rollback_error) = tx.rollback().await {
                    warn!("Rollback of table {} failed: {}", self.table, rollback_error);
                }
                return Err(e);
            }
        }

        tx.commit().await
    }

    fn log_progress(&self) {
        let written = self.written.get();
        if written < self.next_progress.get() {
            return;
        }

        let elapsed = self
            .started
            .get()
            .map(|started| started.elapsed().as_secs_f64())
            .unwrap_or_default();

        match self.expected_rows {
            Some(total) if total > 0 => info!(
                "  -> Inserted {}/{} rows ({:.1}%) - {:.0} rows/s",
                written,
                total,
                written as f64 * 100.0 / total as f64,
                rate(written, elapsed)
            ),
            _ => info!(
                "  -> Inserted {} rows - {:.0} rows/s",
                written,
                rate(written, elapsed)
            ),
        }

        let mut next = self.next_progress.get();
        while next <= written {
            next += self.progress_every;
        }
        self.next_progress.set(next);
    }
}

impl ItemWriter<Record> for PostgresTableWriter<'_> {
    fn write(&self, items: &[Record]) -> ItemWriterResult {
        if items.is_empty() {
            return Ok(());
        }

        if let Some(index) = items.iter().position(|item| item.len() != self.columns.len()) {
            return Err(BatchError::ItemWriter(format!(
                "record {} of the chunk has {} values, table {} expects {}",
                index,
                items[index].len(),
                self.table,
                self.columns.len()
            )));
        }

        match block_on(self.insert_chunk(items)) {
            Ok(()) => {
                self.written.set(self.written.get() + items.len());
                debug!(
                    "Committed {} rows into table {}",
                    items.len(),
                    self.table
                );
                self.log_progress();
                Ok(())
            }
            Err(e) => {
                error!("Failed to load chunk into table {}: {}", self.table, e);
                Err(BatchError::ItemWriter(format!(
                    "PostgreSQL write failed: {}",
                    e
                )))
            }
        }
    }

    fn open(&self) -> ItemWriterResult {
        if self.columns.is_empty() {
            return Err(BatchError::ItemWriter(format!(
                "no columns to load into table {}",
                self.table
            )));
        }

        info!("Truncating table {}...", self.table);

        let destination = block_on(async {
            self.truncate().await?;
            self.destination_types().await
        })
        .map_err(|e| {
            error!("Failed to prepare table {}: {}", self.table, e);
            BatchError::ItemWriter(format!("PostgreSQL truncate failed: {}", e))
        })?;

        *self.column_types.borrow_mut() = self.resolve_types(&destination)?;
        self.written.set(0);
        self.next_progress.set(self.progress_every);
        self.started.set(Some(Instant::now()));

        info!("Table {} truncated", self.table);
        Ok(())
    }

    fn close(&self) -> ItemWriterResult {
        let statement = format!("SELECT COUNT(*) FROM {}", self.table);

        let count: i64 = block_on(sqlx::query_scalar::<Postgres, i64>(&statement).fetch_one(self.pool))
            .map_err(|e| BatchError::ItemWriter(format!("PostgreSQL count failed: {}", e)))?;

        self.verified_count.set(Some(count));
        info!("Rows in table {}: {}", self.table, count);
        Ok(())
    }
}

/// Type a bound text value is cast to before it is assigned to a column.
///
/// An explicit cast to `character(n)`, `character varying(n)` or `bit(n)` cuts
/// the value to length, and without the modifier `character` and `bit` mean a
/// length of one. Those columns get an unconstrained cast so the assignment
/// itself checks the length; every other type keeps its declared modifier.
fn insert_cast(type_name: &str, declared: &str) -> String {
    match type_name {
        "bpchar" | "varchar" => "text".to_string(),
        "bit" => "varbit".to_string(),
        "_bpchar" | "_varchar" => "text[]".to_string(),
        "_bit" => "varbit[]".to_string(),
        _ => declared.to_string(),
    }
}

/// One multi-row `INSERT` for `records`, every placeholder cast to its column type.
fn build_insert(
    table: &str,
    columns: &Columns,
    column_types: &[String],
    records: &[Record],
) -> QueryBuilder<'static, Postgres> {
    let column_clause: Vec<String> = columns.names().iter().map(|c| quote_column(c)).collect();

    let mut query_builder = QueryBuilder::new("INSERT INTO ");
    query_builder.push(table);
    query_builder.push(" (");
    query_builder.push(column_clause.join(", "));
    query_builder.push(") ");

    query_builder.push_values(records, |mut b, record| {
        for (value, column_type) in record.values().iter().zip(column_types) {
            b.push_bind(value.to_sql_text())
                .push_unseparated(format!("::{}", column_type));
        }
    });

    query_builder
}
