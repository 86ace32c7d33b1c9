use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use chrono::{Local, NaiveDate};
use log::{info, warn};

use crate::{
    BatchError,
    config::{Config, QueryFiles, TransferConfig, TransferProtocol},
    core::{
        block_on,
        job::{Job, JobBuilder},
        record::Record,
        step::StepBuilder,
    },
    item::{
        RecordExtractor,
        cleaner::CleaningProcessor,
        memory::InMemoryItemReader,
        rdbc::{
            postgres_writer::PostgresTableWriter,
            qualified_table,
            query::{QueryTemplate, load_query_file},
            source_reader::SqlSourceReaderBuilder,
        },
    },
    tasklet::{
        export::ExportTaskletBuilder,
        ftp::{FtpPutTaskletBuilder, FtpsConnector, SessionConnector, UploadOutcome},
        repair::BackslashRepair,
        sftp::SftpConnector,
    },
};

use super::{DEFAULT_BATCH_SIZE, ExportResult, RunSummary, destination_pool, ensure_extracted};

/// Name of the cut-off column and of the template parameter carrying its value.
pub const CUT_OFF_COLUMN: &str = "fecha_corte";

/// The SQL-to-warehouse jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlJob {
    StudentBenefits,
    SiesData,
    FacultySurvey,
    MoodleOperational,
}

/// How one SQL job extracts, cleans and loads.
#[derive(Debug, Clone, PartialEq)]
pub struct TableProfile {
    pub name: &'static str,
    pub table: &'static str,
    pub fetch_size: usize,
    pub batch_size: usize,
    pub progress_every: usize,
    pub blank_to_null: bool,
    /// Appends the cut-off date under [`CUT_OFF_COLUMN`].
    pub append_cut_off: bool,
    /// The query file is a template rendered with `{fecha_corte}`.
    pub templated: bool,
    /// Lines from this marker on are dropped from the query.
    pub truncate_marker: Option<&'static str>,
    /// File name of the delimited export, for jobs that upload one.
    pub export_file: Option<&'static str>,
}

impl SqlJob {
    pub const ALL: [SqlJob; 4] = [
        SqlJob::StudentBenefits,
        SqlJob::SiesData,
        SqlJob::FacultySurvey,
        SqlJob::MoodleOperational,
    ];

    pub fn profile(self) -> TableProfile {
        let base = TableProfile {
            name: "",
            table: "",
            fetch_size: 1000,
            batch_size: DEFAULT_BATCH_SIZE,
            progress_every: 10_000,
            blank_to_null: false,
            append_cut_off: false,
            templated: false,
            truncate_marker: None,
            export_file: None,
        };

        match self {
            SqlJob::StudentBenefits => TableProfile {
                name: "student-benefits",
                table: "05_beneficios_alumnos",
                export_file: Some("05_beneficios_alumnos.csv"),
                ..base
            },
            SqlJob::SiesData => TableProfile {
                name: "sies-data",
                table: "11_datos_sies",
                append_cut_off: true,
                ..base
            },
            SqlJob::FacultySurvey => TableProfile {
                name: "faculty-survey",
                table: "03_encuesta_docente",
                fetch_size: 5000,
                batch_size: 5000,
                progress_every: 50_000,
                templated: true,
                truncate_marker: Some("-- Para exportar"),
                ..base
            },
            SqlJob::MoodleOperational => TableProfile {
                name: "moodle-operational",
                table: "07_datos_moodle_operacional",
                blank_to_null: true,
                ..base
            },
        }
    }

    pub fn query_file(self, queries: &QueryFiles) -> &Path {
        match self {
            SqlJob::StudentBenefits => &queries.benefits,
            SqlJob::SiesData => &queries.sies,
            SqlJob::FacultySurvey => &queries.survey,
            SqlJob::MoodleOperational => &queries.moodle,
        }
    }
}

/// Reads the job's query and renders it when the profile uses a template.
pub fn prepare_query(
    profile: &TableProfile,
    path: &Path,
    cut_off: NaiveDate,
) -> Result<String, BatchError> {
    let text = load_query_file(path)?;

    if !profile.templated {
        return Ok(text);
    }

    let mut template = QueryTemplate::parse(&text);
    if let Some(marker) = profile.truncate_marker {
        template = template.truncate_at(marker);
    }

    let mut params = BTreeMap::new();
    params.insert(
        CUT_OFF_COLUMN.to_string(),
        format!("'{}'", cut_off.format("%Y-%m-%d")),
    );

    template.render(&params)
}

/// Connector of the configured upload transport.
pub fn transfer_connector(transfer: &TransferConfig, host: &str) -> Box<dyn SessionConnector> {
    let timeout = Duration::from_secs(transfer.timeout_secs);

    match transfer.protocol {
        TransferProtocol::Sftp => Box::new(
            SftpConnector::new(host, transfer.port, &transfer.user, &transfer.password)
                .timeout(timeout),
        ),
        TransferProtocol::Ftps | TransferProtocol::Ftp => Box::new(
            FtpsConnector::new(host, transfer.port, &transfer.user, &transfer.password)
                .timeout(timeout)
                .secure(transfer.protocol == TransferProtocol::Ftps),
        ),
    }
}

/// Runs one SQL job end to end.
pub fn run(job: SqlJob, config: &Config) -> Result<RunSummary, BatchError> {
    let started = Instant::now();
    let profile = job.profile();
    let cut_off = Local::now().date_naive();
    let batch_size = config.batch_size.unwrap_or(profile.batch_size);

    info!("Job {}: source query to {}", profile.name, profile.table);
    info!("Cut-off date: {}", cut_off);

    let query = prepare_query(&profile, job.query_file(&config.queries), cut_off)?;

    let extracted = SqlSourceReaderBuilder::new()
        .url(config.source.url()?)
        .query(&query)
        .fetch_size(profile.fetch_size)
        .progress_every(profile.progress_every)
        .connect_timeout(Duration::from_secs(config.source.connect_timeout_secs))
        .build()?
        .extract()?;

    ensure_extracted(&extracted)?;
    let extracted_rows = extracted.len();
    info!("Extracted {} rows, {} columns", extracted_rows, extracted.columns.len());

    let mut cleaner = CleaningProcessor::new().blank_to_null(profile.blank_to_null);
    if profile.append_cut_off {
        cleaner = cleaner.cut_off(cut_off, CUT_OFF_COLUMN);
    }
    let columns = cleaner.columns(&extracted.columns);
    let table = qualified_table(&config.destination.schema, profile.table);

    let pool = destination_pool(&config.destination)?;

    let reader = InMemoryItemReader::new(extracted.records);
    let writer = PostgresTableWriter::new(&pool, &table, columns.clone())
        .expected_rows(extracted_rows)
        .progress_every(profile.progress_every);

    let load_step = StepBuilder::new("load")
        .chunk::<Record, Record>(batch_size)
        .reader(&reader)
        .processor(&cleaner)
        .writer(&writer)
        .build()?;

    let repair = BackslashRepair::default();
    let export_path: Option<PathBuf> = profile
        .export_file
        .map(|file_name| config.export_dir.join(file_name));

    let export_tasklet = export_path
        .as_ref()
        .map(|output| {
            ExportTaskletBuilder::new()
                .pool(&pool)
                .table(&table)
                .columns(columns.clone())
                .output(output)
                .repair(&repair)
                .build()
        })
        .transpose()?;
    let export_step = export_tasklet
        .as_ref()
        .map(|tasklet| StepBuilder::new("export").tasklet(tasklet).build())
        .transpose()?;

    let connector = match (&export_path, config.transfer.host.as_deref()) {
        (Some(_), Some(host)) if config.transfer.enabled() => {
            Some(transfer_connector(&config.transfer, host))
        }
        (Some(_), _) => {
            warn!("FTP_HOST is not set, the export will not be uploaded");
            None
        }
        _ => None,
    };
    let upload_tasklet = match (&connector, &export_path) {
        (Some(connector), Some(output)) => Some(
            FtpPutTaskletBuilder::new()
                .connector(connector.as_ref())
                .local_file(output)
                .upload_path(&config.transfer.upload_path)
                .chroot_dir(&config.transfer.chroot_dir)
                .build()?,
        ),
        _ => None,
    };
    let upload_step = upload_tasklet
        .as_ref()
        .map(|tasklet| StepBuilder::new("upload").tasklet(tasklet).build())
        .transpose()?;

    let mut builder = JobBuilder::new()
        .name(profile.name.to_string())
        .start(&load_step);
    if let Some(step) = &export_step {
        builder = builder.next_optional(step);
    }
    if let Some(step) = &upload_step {
        builder = builder.next_optional(step);
    }
    let result = builder.build().run();

    block_on(pool.close());
    result?;

    let mut summary = RunSummary::new(profile.name, extracted_rows, started);
    summary.loaded = writer.verified_count();
    summary.export = export_tasklet.as_ref().map(|tasklet| match tasklet.output() {
        Some(path) => ExportResult::Written(path),
        None => ExportResult::NotGenerated,
    });
    summary.upload = match (&upload_tasklet, &export_tasklet) {
        (Some(tasklet), _) => Some(tasklet.outcome()),
        (None, Some(_)) => Some(UploadOutcome::NotRun),
        _ => None,
    };

    summary.log();
    Ok(summary)
}
