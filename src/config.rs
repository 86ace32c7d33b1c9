//! Run configuration, read once at start-up from the environment (and `.env`).

use std::{path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;

use crate::BatchError;

pub const DEFAULT_DB_HOST: &str = "localhost";

pub const DEFAULT_DB_PORT: u16 = 5432;

pub const DEFAULT_DB_NAME: &str = "postgres";

pub const DEFAULT_DB_USER: &str = "postgres";

pub const DEFAULT_SEARCH_PATH: &str = "nimbi, public";

pub const DEFAULT_SCHEMA: &str = "nimbi";

pub const DEFAULT_API_BASE_URL: &str = "https://servicios-api.uniacc.crm-mantis.cl";

/// Default SSH port, used by the SFTP transport.
pub const DEFAULT_SFTP_PORT: u16 = 22;

/// Default FTP control port.
pub const DEFAULT_FTP_PORT: u16 = 21;

pub const DEFAULT_UPLOAD_PATH: &str = "/sftp/nimbi/";

pub const DEFAULT_CHROOT_DIR: &str = "nimbi";

/// Default transfer timeout in seconds (10 minutes).
pub const DEFAULT_FTP_TIMEOUT_SECS: u64 = 600;

pub const DEFAULT_EXPORT_DIR: &str = "temp_csv";

pub const DEFAULT_BACKUP_DIR: &str = "backups";

/// Whole run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub destination: DestinationConfig,
    pub source: SourceConfig,
    pub api: ApiConfig,
    pub transfer: TransferConfig,
    /// First month fetched by the CRM job.
    pub start: StartMonth,
    pub queries: QueryFiles,
    /// Overrides the load batch size of every job.
    pub batch_size: Option<usize>,
    pub export_dir: PathBuf,
    pub backup_dir: PathBuf,
}

/// Destination PostgreSQL warehouse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub search_path: String,
    /// Schema holding the destination tables.
    pub schema: String,
}

impl DestinationConfig {
    /// Connection options with the search path applied to every session.
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user)
            .password(&self.password)
            .options([("search_path", escape_option_value(&self.search_path))])
    }
}

/// The server splits the startup `options` string on whitespace; a backslash
/// keeps the next character inside the value.
fn escape_option_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '\\' || c.is_whitespace() {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Source database of the SQL jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// `postgres://`, `mysql://` or `sqlite:` URL.
    pub url: Option<String>,
    pub connect_timeout_secs: u64,
}

impl SourceConfig {
    pub fn url(&self) -> Result<&str, BatchError> {
        self.url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| BatchError::Configuration("SOURCE_DATABASE_URL is not set".to_string()))
    }
}

/// CRM REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub usuario: Option<String>,
    pub clave: Option<String>,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
    /// Pause between two monthly fetches.
    pub month_delay_secs: u64,
    /// Log in again when a month is rejected with 401.
    pub refresh_token: bool,
}

impl ApiConfig {
    pub fn credentials(&self) -> Result<(&str, &str), BatchError> {
        match (self.usuario.as_deref(), self.clave.as_deref()) {
            (Some(usuario), Some(clave)) if !usuario.is_empty() => Ok((usuario, clave)),
            _ => Err(BatchError::Configuration(
                "API_USUARIO and API_CLAVE must be set".to_string(),
            )),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

/// Remote server receiving the export file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    pub host: Option<String>,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub upload_path: String,
    pub chroot_dir: String,
    pub timeout_secs: u64,
    pub protocol: TransferProtocol,
}

/// Transport used to upload the export file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferProtocol {
    Sftp,
    /// FTP with explicit TLS on the control and data channels.
    Ftps,
    Ftp,
}

impl TransferProtocol {
    pub fn default_port(self) -> u16 {
        match self {
            TransferProtocol::Sftp => DEFAULT_SFTP_PORT,
            TransferProtocol::Ftps | TransferProtocol::Ftp => DEFAULT_FTP_PORT,
        }
    }
}

impl FromStr for TransferProtocol {
    type Err = BatchError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sftp" => Ok(TransferProtocol::Sftp),
            "ftps" => Ok(TransferProtocol::Ftps),
            "ftp" => Ok(TransferProtocol::Ftp),
            other => Err(BatchError::Configuration(format!(
                "unknown transfer protocol: {}",
                other
            ))),
        }
    }
}

impl TransferConfig {
    /// The upload is only attempted when a host is configured.
    pub fn enabled(&self) -> bool {
        self.host.as_deref().is_some_and(|host| !host.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StartMonth {
    pub year: i32,
    pub month: u32,
}

/// Source query file of each SQL job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryFiles {
    pub benefits: PathBuf,
    pub sies: PathBuf,
    pub survey: PathBuf,
    pub moodle: PathBuf,
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, BatchError> {
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|_| {
            BatchError::Configuration(format!("{} has an invalid value: {}", key, raw))
        }),
        _ => Ok(default),
    }
}

fn string_var(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    lookup(key).unwrap_or_else(|| default.to_string())
}

fn flag_var(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> Result<bool, BatchError> {
    match lookup(key).map(|raw| raw.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(raw) => match raw.as_str() {
            "" => Ok(default),
            "1" | "true" | "yes" | "si" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(BatchError::Configuration(format!(
                "{} must be a boolean, got {}",
                key, raw
            ))),
        },
    }
}

impl Config {
    /// Loads `.env` when present, then reads the process environment.
    pub fn load() -> Result<Self, BatchError> {
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Builds the configuration from any key-value source, applying defaults.
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self, BatchError> {
        let lookup = &lookup;

        let protocol = parse_var(lookup, "FTP_PROTOCOL", TransferProtocol::Sftp)?;

        Ok(Config {
            destination: DestinationConfig {
                host: string_var(lookup, "DB_HOST", DEFAULT_DB_HOST),
                port: parse_var(lookup, "DB_PORT", DEFAULT_DB_PORT)?,
                database: string_var(lookup, "DB_NAME", DEFAULT_DB_NAME),
                user: string_var(lookup, "DB_USER", DEFAULT_DB_USER),
                password: string_var(lookup, "DB_PASSWORD", ""),
                search_path: string_var(lookup, "DB_SEARCH_PATH", DEFAULT_SEARCH_PATH),
                schema: string_var(lookup, "DB_SCHEMA", DEFAULT_SCHEMA),
            },
            source: SourceConfig {
                url: lookup("SOURCE_DATABASE_URL"),
                connect_timeout_secs: parse_var(lookup, "SOURCE_CONNECT_TIMEOUT", 30)?,
            },
            api: ApiConfig {
                base_url: string_var(lookup, "API_BASE_URL", DEFAULT_API_BASE_URL)
                    .trim_end_matches('/')
                    .to_string(),
                usuario: lookup("API_USUARIO"),
                clave: lookup("API_CLAVE"),
                connect_timeout_secs: parse_var(lookup, "API_TIMEOUT_CONEXION", 30)?,
                read_timeout_secs: parse_var(lookup, "API_TIMEOUT_LECTURA", 300)?,
                max_attempts: parse_var(lookup, "API_MAX_REINTENTOS", 3)?,
                retry_delay_secs: parse_var(lookup, "API_DELAY_REINTENTO", 5)?,
                month_delay_secs: parse_var(lookup, "API_DELAY_ENTRE_MESES", 10)?,
                refresh_token: flag_var(lookup, "API_REFRESH_TOKEN", false)?,
            },
            transfer: TransferConfig {
                host: lookup("FTP_HOST"),
                port: parse_var(lookup, "FTP_PORT", protocol.default_port())?,
                user: string_var(lookup, "FTP_USER", "nimbi"),
                password: string_var(lookup, "FTP_PASSWORD", ""),
                upload_path: string_var(lookup, "FTP_UPLOAD_PATH", DEFAULT_UPLOAD_PATH),
                chroot_dir: string_var(lookup, "FTP_CHROOT_DIR", DEFAULT_CHROOT_DIR),
                timeout_secs: parse_var(lookup, "FTP_TIMEOUT", DEFAULT_FTP_TIMEOUT_SECS)?,
                protocol,
            },
            start: StartMonth {
                year: parse_var(lookup, "FECHA_INICIO_ANO", 2025)?,
                month: parse_var(lookup, "FECHA_INICIO_MES", 1)?,
            },
            queries: QueryFiles {
                benefits: string_var(lookup, "SQL_FILE_BENEFICIOS", "sql/5_beneficios_alumnos.sql")
                    .into(),
                sies: string_var(lookup, "SQL_FILE_SIES", "sql/11_datos_sies.sql").into(),
                survey: string_var(lookup, "SQL_FILE_ENCUESTA", "sql/3_encuenta_docente.sql")
                    .into(),
                moodle: string_var(lookup, "SQL_FILE_MOODLE", "sql/7_datos_moodle_operacional.sql")
                    .into(),
            },
            batch_size: lookup("LOAD_BATCH_SIZE")
                .map(|raw| {
                    raw.trim().parse().map_err(|_| {
                        BatchError::Configuration(format!(
                            "LOAD_BATCH_SIZE has an invalid value: {}",
                            raw
                        ))
                    })
                })
                .transpose()?,
            export_dir: string_var(lookup, "EXPORT_DIR", DEFAULT_EXPORT_DIR).into(),
            backup_dir: string_var(lookup, "BACKUP_DIR", DEFAULT_BACKUP_DIR).into(),
        })
    }

    /// Rejects values no job can run with.
    pub fn validate(&self) -> Result<(), BatchError> {
        let invalid = |message: &str| Err(BatchError::Configuration(message.to_string()));

        if self.destination.host.trim().is_empty() {
            return invalid("DB_HOST must not be empty");
        }
        if self.destination.schema.trim().is_empty() {
            return invalid("DB_SCHEMA must not be empty");
        }
        if self.api.max_attempts == 0 {
            return invalid("API_MAX_REINTENTOS must be at least 1");
        }
        if !(1..=12).contains(&self.start.month) {
            return invalid("FECHA_INICIO_MES must be between 1 and 12");
        }
        if self.batch_size == Some(0) {
            return invalid("LOAD_BATCH_SIZE must be positive");
        }
        if self.transfer.enabled() && self.transfer.timeout_secs == 0 {
            return invalid("FTP_TIMEOUT must be positive");
        }

        Ok(())
    }
}
