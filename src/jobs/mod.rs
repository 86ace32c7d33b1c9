//! # Jobs
//!
//! Wiring of the batch jobs: each one extracts a [`RecordSet`], then runs a
//! [`Job`](crate::core::job::Job) whose mandatory first step truncates and loads
//! the destination table. Export and upload steps, when a job has them, are
//! optional: their failure is logged and the run still succeeds.
//!
//! An empty extraction aborts the run before the destination table is touched.

use std::{
    fmt,
    path::PathBuf,
    time::{Duration, Instant},
};

use log::info;
use sqlx::{PgPool, postgres::PgPoolOptions};

use crate::{
    BatchError,
    config::DestinationConfig,
    core::{block_on, record::RecordSet},
    tasklet::ftp::UploadOutcome,
};

/// CRM requests loaded from the REST API.
pub mod crm_requests;

/// Jobs copying one SQL query result into one warehouse table.
pub mod sql_table;

/// Default number of records per load transaction.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Opens the single destination connection shared by every step of a run.
pub fn destination_pool(config: &DestinationConfig) -> Result<PgPool, BatchError> {
    info!(
        "Connecting to PostgreSQL {}:{}/{}...",
        config.host, config.port, config.database
    );

    let pool = block_on(
        PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(config.connect_options()),
    )
    .map_err(|e| BatchError::ItemWriter(format!("connecting to PostgreSQL: {}", e)))?;

    info!("Connected to PostgreSQL (search_path: {})", config.search_path);
    Ok(pool)
}

/// Fails the run when the source returned nothing, before anything is truncated.
pub fn ensure_extracted(record_set: &RecordSet) -> Result<(), BatchError> {
    record_set.ensure_aligned()?;

    if record_set.is_empty() {
        return Err(BatchError::ItemReader(
            "no rows were extracted, aborting".to_string(),
        ));
    }

    Ok(())
}

/// Outcome of a finished run, logged as the final summary.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub job: String,
    pub extracted: usize,
    /// `COUNT(*)` of the destination table after the load.
    pub loaded: Option<i64>,
    /// Export file, for jobs that produce one.
    pub export: Option<ExportResult>,
    pub upload: Option<UploadOutcome>,
    pub duration: Duration,
}

/// What the export step left on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportResult {
    Written(PathBuf),
    /// Empty table or failed export.
    NotGenerated,
}

impl RunSummary {
    pub fn new(job: &str, extracted: usize, started: Instant) -> Self {
        Self {
            job: job.to_string(),
            extracted,
            loaded: None,
            export: None,
            upload: None,
            duration: started.elapsed(),
        }
    }

    /// Extracted rows per second over the whole run.
    pub fn throughput(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.extracted as f64 / secs
        } else {
            0.0
        }
    }

    pub fn log(&self) {
        for line in self.to_string().lines() {
            info!("{}", line);
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Summary of {}", self.job)?;
        writeln!(f, "  Rows extracted: {}", self.extracted)?;

        match self.loaded {
            Some(count) => writeln!(f, "  Rows in PostgreSQL: {}", count)?,
            None => writeln!(f, "  Rows in PostgreSQL: unknown")?,
        }

        match &self.export {
            Some(ExportResult::Written(path)) => writeln!(f, "  Export: {}", path.display())?,
            Some(ExportResult::NotGenerated) => writeln!(f, "  Export: not generated")?,
            None => {}
        }

        match &self.upload {
            Some(UploadOutcome::Uploaded(remote)) => writeln!(f, "  Upload: {}", remote)?,
            Some(UploadOutcome::Failed) => writeln!(f, "  Upload: failed")?,
            Some(UploadOutcome::Skipped) => writeln!(f, "  Upload: skipped, no file")?,
            Some(UploadOutcome::NotRun) => writeln!(f, "  Upload: not configured")?,
            None => {}
        }

        writeln!(f, "  Duration: {:.2} seconds", self.duration.as_secs_f64())?;
        write!(f, "  Throughput: {:.0} rows/s", self.throughput())
    }
}
