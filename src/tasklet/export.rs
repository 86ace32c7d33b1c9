//! # Export Tasklet
//!
//! Re-reads a loaded table and writes it as a delimited file:
//!
//! - rows ordered by the first column, so two exports of the same data are identical
//! - every field double quoted, UTF-8, `\n` line endings, header row from the column list
//! - `NULL` written as an empty field
//!
//! A stale file from a previous run is removed first. When the table is empty
//! or the export fails, no file is left behind and [`ExportTasklet::output`]
//! stays `None`; the upload step then has nothing to send.

use std::{
    cell::RefCell,
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::Instant,
};

use log::{error, info, warn};
use sqlx::{PgPool, Row};

use crate::{
    core::{
        block_on,
        item::ItemWriter,
        record::{Columns, Record, Value},
        step::{RepeatStatus, StepExecution, Tasklet},
    },
    item::{csv::csv_writer::CsvRecordWriterBuilder, rdbc::quote_column},
    tasklet::repair::ExportRepair,
    BatchError,
};

/// Serializes a header and `records` to `writer`, returning the writer.
pub fn write_delimited<W: Write>(
    columns: &Columns,
    records: &[Record],
    delimiter: u8,
    writer: W,
) -> Result<W, BatchError> {
    let csv_writer = CsvRecordWriterBuilder::new()
        .delimiter(delimiter)
        .headers(columns.clone())
        .from_writer(writer);

    csv_writer.open()?;
    csv_writer.write(records)?;
    csv_writer.close()?;

    csv_writer.into_inner()
}

/// `SELECT` returning every column as text, ordered by the first column's own type.
fn export_query(table: &str, columns: &Columns) -> String {
    let projection: Vec<String> = columns
        .names()
        .iter()
        .map(|column| {
            let column = quote_column(column);
            format!("{}::text AS {}", column, column)
        })
        .collect();

    let first = columns.first().map(quote_column).unwrap_or_default();

    format!(
        "SELECT {} FROM {} AS src ORDER BY src.{}",
        projection.join(", "),
        table,
        first
    )
}

pub struct ExportTasklet<'a> {
    pool: &'a PgPool,
    table: String,
    columns: Columns,
    output: PathBuf,
    delimiter: u8,
    repair: &'a dyn ExportRepair,
    written: RefCell<Option<PathBuf>>,
}

impl<'a> ExportTasklet<'a> {
    /// Path of the file produced by the last execution, if any.
    pub fn output(&self) -> Option<PathBuf> {
        self.written.borrow().clone()
    }

    fn read_table(&self) -> Result<Vec<Record>, BatchError> {
        let query = export_query(&self.table, &self.columns);

        let rows = block_on(sqlx::query(&query).fetch_all(self.pool))
            .map_err(|e| BatchError::Export(format!("reading table {}: {}", self.table, e)))?;

        rows.iter()
            .map(|row| {
                (0..self.columns.len())
                    .map(|index| {
                        row.try_get::<Option<String>, _>(index)
                            .map(|text| text.map(Value::Text).unwrap_or(Value::Null))
                            .map_err(|e| BatchError::Export(e.to_string()))
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map(Record::new)
            })
            .collect()
    }

    fn export(&self) -> Result<Option<PathBuf>, BatchError> {
        let start = Instant::now();

        if self.output.exists() {
            fs::remove_file(&self.output)?;
            info!("Removed previous export {}", self.output.display());
        }

        info!("Reading table {} for export...", self.table);
        let records = self.read_table()?;

        if records.is_empty() {
            warn!("Table {} is empty, no export generated", self.table);
            return Ok(None);
        }
        info!("  -> Rows read: {}", records.len());

        if let Some(parent) = self.output.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = fs::File::create(&self.output)?;
        let mut file = write_delimited(&self.columns, &records, self.delimiter, file)?;
        file.flush()?;

        if let Err(e) = self.repair.repair(&self.output) {
            warn!("Export repair failed, keeping the file as written: {}", e);
        }

        let size = fs::metadata(&self.output)?.len();
        info!("Export generated: {}", self.output.display());
        info!("  -> Size: {:.2} MB", size as f64 / 1024.0 / 1024.0);
        info!("  -> Rows: {}", records.len());
        info!("  -> Columns: {}", self.columns.len());
        info!("  -> Duration: {:.2} seconds", start.elapsed().as_secs_f64());

        Ok(Some(self.output.clone()))
    }
}

impl Tasklet for ExportTasklet<'_> {
    fn execute(&self, _step_execution: &StepExecution) -> Result<RepeatStatus, BatchError> {
        *self.written.borrow_mut() = None;

        match self.export() {
            Ok(output) => {
                *self.written.borrow_mut() = output;
                Ok(RepeatStatus::Finished)
            }
            Err(e) => {
                error!("Export of table {} failed: {}", self.table, e);
                remove_partial(&self.output);
                Err(e)
            }
        }
    }
}

fn remove_partial(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!("Could not remove partial export {}: {}", path.display(), e);
        }
    }
}

#[derive(Default)]
pub struct ExportTaskletBuilder<'a> {
    pool: Option<&'a PgPool>,
    table: Option<String>,
    columns: Option<Columns>,
    output: Option<PathBuf>,
    delimiter: Option<u8>,
    repair: Option<&'a dyn ExportRepair>,
}

impl<'a> ExportTaskletBuilder<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool(mut self, pool: &'a PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn table(mut self, table: &str) -> Self {
        self.table = Some(table.to_string());
        self
    }

    pub fn columns(mut self, columns: Columns) -> Self {
        self.columns = Some(columns);
        self
    }

    pub fn output<P: AsRef<Path>>(mut self, output: P) -> Self {
        self.output = Some(output.as_ref().to_path_buf());
        self
    }

    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = Some(delimiter);
        self
    }

    pub fn repair(mut self, repair: &'a dyn ExportRepair) -> Self {
        self.repair = Some(repair);
        self
    }

    pub fn build(self) -> Result<ExportTasklet<'a>, BatchError> {
        let missing = |part: &str| BatchError::Configuration(format!("Export {} is required", part));

        let columns = self.columns.ok_or_else(|| missing("column list"))?;
        if columns.is_empty() {
            return Err(BatchError::Configuration(
                "Export column list must not be empty".to_string(),
            ));
        }

        Ok(ExportTasklet {
            pool: self.pool.ok_or_else(|| missing("pool"))?,
            table: self.table.ok_or_else(|| missing("table"))?,
            columns,
            output: self.output.ok_or_else(|| missing("output path"))?,
            delimiter: self.delimiter.unwrap_or(b';'),
            repair: self.repair.ok_or_else(|| missing("repair"))?,
            written: RefCell::new(None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_query_casts_and_orders_by_first_column() {
        let query = export_query(
            "nimbi.\"05_beneficios_alumnos\"",
            &Columns::new(["rut", "Año"]),
        );

        assert_eq!(
            query,
            "SELECT rut::text AS rut, \"Año\"::text AS \"Año\" \
             FROM nimbi.\"05_beneficios_alumnos\" AS src ORDER BY src.rut"
        );
    }

    #[test]
    fn delimited_output_has_header_and_quoted_fields() {
        let columns = Columns::new(["code", "value"]);
        let records = vec![
            Record::new(vec![Value::from("A"), Value::from("1;2")]),
            Record::new(vec![Value::from("B"), Value::Null]),
        ];

        let bytes = write_delimited(&columns, &records, b';', Vec::new()).unwrap();

        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "\"code\";\"value\"\n\"A\";\"1;2\"\n\"B\";\"\"\n"
        );
    }

    #[test]
    fn builder_rejects_missing_parts() {
        let result = ExportTaskletBuilder::new()
            .table("t")
            .columns(Columns::new(["a"]))
            .build();

        assert!(matches!(result, Err(BatchError::Configuration(_))));
    }
}
