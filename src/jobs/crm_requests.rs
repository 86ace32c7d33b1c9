//! CRM requests: every month from the configured start through the current one,
//! deduplicated by `cod_incidencia` and loaded into `10_solicitudes_crm`.
//!
//! The raw payload is written to a backup file before the destination table is
//! truncated. The backup is deleted once the load succeeded and kept otherwise,
//! so a failed run can be replayed by hand.

use std::{
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use chrono::Local;
use log::{error, info, warn};
use serde_json::Value as Json;

use crate::{
    BatchError,
    config::Config,
    core::{
        block_on,
        item::{ItemWriter, PassThroughProcessor},
        job::{Job, JobBuilder},
        record::Record,
        step::StepBuilder,
    },
    item::{
        api::{
            client::CrmClient,
            fetcher::{LoginTokenProvider, ResilientFetcher},
            partition::{MonthPartition, months_to_fetch},
            requests::CrmRequestExtractor,
            retry::RetryPolicy,
        },
        RecordExtractor,
        memory::InMemoryItemReader,
        rdbc::{postgres_writer::PostgresTableWriter, qualified_table},
    },
};

use super::{DEFAULT_BATCH_SIZE, RunSummary, destination_pool, ensure_extracted};

pub const JOB_NAME: &str = "crm-requests";

pub const TABLE: &str = "10_solicitudes_crm";

/// Writes `items` as pretty JSON to a new timestamped file in `dir`.
pub fn save_backup(dir: &Path, items: &[Json]) -> Result<PathBuf, BatchError> {
    fs::create_dir_all(dir)?;

    let path = dir.join(format!(
        "solicitudes_crm_backup_{}.json",
        Local::now().format("%Y%m%d_%H%M%S")
    ));

    let writer = BufWriter::new(File::create(&path)?);
    serde_json::to_writer_pretty(writer, items)
        .map_err(|e| BatchError::Io(std::io::Error::other(e)))?;

    info!("Backup saved: {}", path.display());
    Ok(path)
}

/// Deletes a backup; a failure only warns.
pub fn remove_backup(path: &Path) -> bool {
    if !path.exists() {
        return true;
    }

    match fs::remove_file(path) {
        Ok(()) => {
            info!("Backup removed: {}", path.display());
            true
        }
        Err(e) => {
            warn!("Could not remove backup {}: {}", path.display(), e);
            false
        }
    }
}

/// Runs `load` after writing `items` to a backup in `dir`.
///
/// The backup is removed when `load` succeeds and kept for a manual replay
/// when it fails.
pub fn with_backup<T>(
    dir: &Path,
    items: &[Json],
    load: impl FnOnce() -> Result<T, BatchError>,
) -> Result<T, BatchError> {
    let backup = save_backup(dir, items)?;

    match load() {
        Ok(value) => {
            remove_backup(&backup);
            Ok(value)
        }
        Err(e) => {
            error!("Load failed, backup kept at {}", backup.display());
            Err(e)
        }
    }
}

/// Truncates and loads the destination through `writer` in chunks of `batch_size`.
pub fn load_records<W: ItemWriter<Record>>(
    writer: &W,
    records: Vec<Record>,
    batch_size: usize,
) -> Result<(), BatchError> {
    let reader = InMemoryItemReader::new(records);
    let processor = PassThroughProcessor::default();

    let load_step = StepBuilder::new("load")
        .chunk::<Record, Record>(batch_size)
        .reader(&reader)
        .processor(&processor)
        .writer(writer)
        .build()?;

    JobBuilder::new()
        .name(JOB_NAME.to_string())
        .start(&load_step)
        .build()
        .run()?;

    Ok(())
}

pub fn run(config: &Config) -> Result<RunSummary, BatchError> {
    let started = Instant::now();
    let today = Local::now().date_naive();
    let batch_size = config.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);

    info!("Job {}: CRM API to {}", JOB_NAME, TABLE);
    info!("Cut-off date: {}", today);

    let (usuario, clave) = config.api.credentials()?;
    let client = CrmClient::new(
        &config.api.base_url,
        usuario,
        clave,
        config.api.connect_timeout(),
        config.api.read_timeout(),
    )?;
    let tokens = LoginTokenProvider::new(&client);
    let fetcher = ResilientFetcher::new(&client, &tokens)
        .policy(RetryPolicy::new(
            config.api.max_attempts,
            Duration::from_secs(config.api.retry_delay_secs),
        ))
        .pacing(Duration::from_secs(config.api.month_delay_secs))
        .refresh_on_unauthorized(config.api.refresh_token);

    let start = MonthPartition::new(config.start.year, config.start.month);
    let extractor = CrmRequestExtractor::new(&fetcher, months_to_fetch(start, today), today);

    let record_set = extractor.extract()?;
    let items = extractor.take_raw();
    ensure_extracted(&record_set)?;
    let extracted_rows = record_set.len();

    let table = qualified_table(&config.destination.schema, TABLE);

    let loaded = with_backup(&config.backup_dir, &items, || {
        let pool = destination_pool(&config.destination)?;
        let writer = PostgresTableWriter::new(&pool, &table, record_set.columns)
            .expected_rows(extracted_rows)
            .progress_every(batch_size * 10);

        let result = load_records(&writer, record_set.records, batch_size);
        block_on(pool.close());

        result.map(|()| writer.verified_count())
    })?;

    let mut summary = RunSummary::new(JOB_NAME, items.len(), started);
    summary.loaded = loaded;
    summary.log();

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::core::{item::ItemWriterResult, record::Value};

    #[test]
    fn backup_is_pretty_json_and_removable() {
        let dir = tempdir().unwrap();
        let items = vec![json!({ "cod_incidencia": 1 }), json!({ "cod_incidencia": 2 })];

        let path = save_backup(&dir.path().join("backups"), &items).unwrap();

        let file_name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file_name.starts_with("solicitudes_crm_backup_"));
        assert!(file_name.ends_with(".json"));

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains('\n'));
        let restored: Vec<Json> = serde_json::from_str(&content).unwrap();
        assert_eq!(restored, items);

        assert!(remove_backup(&path));
        assert!(!path.exists());
        assert!(remove_backup(&path));
    }

    /// Keeps every committed chunk, optionally failing on one of them.
    struct ChunkRecorder {
        rows: RefCell<Vec<Record>>,
        fail_on_write: bool,
    }

    impl ChunkRecorder {
        fn new(fail_on_write: bool) -> Self {
            Self {
                rows: RefCell::new(Vec::new()),
                fail_on_write,
            }
        }
    }

    impl ItemWriter<Record> for ChunkRecorder {
        fn write(&self, items: &[Record]) -> ItemWriterResult {
            if self.fail_on_write {
                return Err(BatchError::ItemWriter("connection lost".to_string()));
            }
            self.rows.borrow_mut().extend_from_slice(items);
            Ok(())
        }
    }

    fn requests() -> (Vec<Json>, Vec<Record>) {
        let items = vec![json!({ "cod_incidencia": 1 }), json!({ "cod_incidencia": 2 })];
        let records = vec![
            Record::new(vec![Value::Int(1)]),
            Record::new(vec![Value::Int(2)]),
        ];
        (items, records)
    }

    fn backups_in(dir: &Path) -> usize {
        fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
    }

    #[test]
    fn backup_is_kept_when_the_load_fails() {
        let dir = tempdir().unwrap();
        let (items, records) = requests();
        let writer = ChunkRecorder::new(true);

        let result = with_backup(dir.path(), &items, || load_records(&writer, records, 1));

        assert!(result.is_err());
        assert_eq!(backups_in(dir.path()), 1);

        let entry = fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap();
        let restored: Vec<Json> =
            serde_json::from_str(&fs::read_to_string(entry.path()).unwrap()).unwrap();
        assert_eq!(restored, items);
    }

    #[test]
    fn backup_is_removed_once_the_load_succeeds() {
        let dir = tempdir().unwrap();
        let (items, records) = requests();
        let writer = ChunkRecorder::new(false);

        let result = with_backup(dir.path(), &items, || load_records(&writer, records, 1));

        assert!(result.is_ok());
        assert_eq!(writer.rows.borrow().len(), 2);
        assert_eq!(backups_in(dir.path()), 0);
    }
}
