//! # FTP Tasklet
//!
//! Uploads the export file to the remote drop directory and checks the remote
//! size afterwards. The transport sits behind [`SessionConnector`]: SFTP (see
//! [`crate::tasklet::sftp`]) or FTP with explicit TLS, plain FTP when `secure`
//! is off.
//!
//! ## Restricted root
//!
//! Some servers confine the account to a root directory and present the
//! configured upload path relative to it. When the last segment of the upload
//! path equals the configured `chroot_dir`, the tasklet changes into that
//! directory and uploads by bare file name; if the directory change is refused
//! it falls back to `<chroot_dir>/<file>`. With any other upload path the file
//! goes to `<upload_path>/<file>`. This mirrors one server layout and is not a
//! general path resolver.
//!
//! ```rust,no_run
//! use warehouse_batch::core::step::{StepBuilder, StepExecution, Step};
//! use warehouse_batch::tasklet::ftp::{FtpPutTaskletBuilder, FtpsConnector};
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), warehouse_batch::BatchError> {
//! let connector = FtpsConnector::new("ftp.example.com", 21, "user", "password")
//!     .timeout(Duration::from_secs(600));
//!
//! let tasklet = FtpPutTaskletBuilder::new()
//!     .connector(&connector)
//!     .local_file("./temp_csv/05_beneficios_alumnos.csv")
//!     .upload_path("/sftp/nimbi/")
//!     .chroot_dir("nimbi")
//!     .build()?;
//!
//! let step = StepBuilder::new("upload").tasklet(&tasklet).build()?;
//! let mut step_execution = StepExecution::new("upload");
//! step.execute(&mut step_execution)?;
//! # Ok(())
//! # }
//! ```

use std::{
    cell::RefCell,
    fs::{self, File},
    io::BufReader,
    net::{SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use suppaftp::{
    native_tls::TlsConnector, types::FileType, NativeTlsConnector, NativeTlsFtpStream,
};

use crate::{
    core::step::{RepeatStatus, StepExecution, Tasklet},
    BatchError,
};

/// The remote operations the upload needs.
pub trait RemoteSession {
    fn pwd(&mut self) -> Result<String, BatchError>;

    fn cwd(&mut self, path: &str) -> Result<(), BatchError>;

    /// Uploads `local` to `remote_path`, returning the bytes sent.
    fn put(&mut self, remote_path: &str, local: &Path) -> Result<u64, BatchError>;

    fn size(&mut self, remote_path: &str) -> Result<u64, BatchError>;

    /// Ends the session. Calling it again is a no-op.
    fn close(&mut self) -> Result<(), BatchError>;
}

/// Opens sessions to one remote server.
pub trait SessionConnector {
    fn connect(&self) -> Result<Box<dyn RemoteSession>, BatchError>;

    /// `host:port`, for logs.
    fn endpoint(&self) -> String;
}

pub(crate) fn transfer_error(action: &str, error: impl std::fmt::Display) -> BatchError {
    BatchError::Transfer(format!("{}: {}", action, error))
}

/// First socket address of `host:port`.
pub(crate) fn socket_addr(host: &str, port: u16) -> Result<SocketAddr, BatchError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| transfer_error(&format!("resolving {}:{}", host, port), e))?
        .next()
        .ok_or_else(|| BatchError::Transfer(format!("no address for {}:{}", host, port)))
}

/// A logged-in FTP session, secured with TLS when requested.
pub struct FtpsSession {
    stream: Option<NativeTlsFtpStream>,
}

impl FtpsSession {
    fn stream(&mut self) -> Result<&mut NativeTlsFtpStream, BatchError> {
        self.stream
            .as_mut()
            .ok_or_else(|| BatchError::Transfer("session already closed".to_string()))
    }
}

impl RemoteSession for FtpsSession {
    fn pwd(&mut self) -> Result<String, BatchError> {
        self.stream()?.pwd().map_err(|e| transfer_error("PWD", e))
    }

    fn cwd(&mut self, path: &str) -> Result<(), BatchError> {
        self.stream()?
            .cwd(path)
            .map_err(|e| transfer_error(&format!("CWD {}", path), e))
    }

    fn put(&mut self, remote_path: &str, local: &Path) -> Result<u64, BatchError> {
        let file = File::open(local).map_err(BatchError::Io)?;
        let mut reader = BufReader::new(file);

        self.stream()?
            .put_file(remote_path, &mut reader)
            .map_err(|e| transfer_error("upload", e))
    }

    fn size(&mut self, remote_path: &str) -> Result<u64, BatchError> {
        self.stream()?
            .size(remote_path)
            .map(|size| size as u64)
            .map_err(|e| transfer_error("SIZE", e))
    }

    fn close(&mut self) -> Result<(), BatchError> {
        match self.stream.take() {
            Some(mut stream) => stream.quit().map_err(|e| transfer_error("QUIT", e)),
            None => Ok(()),
        }
    }
}

/// Connection settings of the FTP(S) server.
pub struct FtpsConnector {
    host: String,
    port: u16,
    username: String,
    password: String,
    timeout: Duration,
    secure: bool,
}

impl FtpsConnector {
    pub fn new(host: &str, port: u16, username: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            username: username.to_string(),
            password: password.to_string(),
            timeout: Duration::from_secs(600),
            secure: true,
        }
    }

    /// Connect timeout, also applied to every read and write on the control channel.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }
}

impl SessionConnector for FtpsConnector {
    fn connect(&self) -> Result<Box<dyn RemoteSession>, BatchError> {
        info!("Connecting to {}...", self.endpoint());

        let mut stream = NativeTlsFtpStream::connect_timeout(socket_addr(&self.host, self.port)?, self.timeout)
            .map_err(|e| transfer_error("connect", e))?;

        if self.secure {
            let tls = TlsConnector::new().map_err(|e| transfer_error("TLS setup", e))?;
            stream = stream
                .into_secure(NativeTlsConnector::from(tls), &self.host)
                .map_err(|e| transfer_error("TLS handshake", e))?;
        }

        stream
            .get_ref()
            .set_read_timeout(Some(self.timeout))
            .map_err(BatchError::Io)?;
        stream
            .get_ref()
            .set_write_timeout(Some(self.timeout))
            .map_err(BatchError::Io)?;

        stream
            .login(&self.username, &self.password)
            .map_err(|e| transfer_error("login", e))?;
        stream
            .transfer_type(FileType::Binary)
            .map_err(|e| transfer_error("TYPE I", e))?;

        info!("Connected to {}", self.endpoint());
        Ok(Box::new(FtpsSession {
            stream: Some(stream),
        }))
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Remote path the file is uploaded to; may change the session's directory.
pub fn resolve_remote_path(
    session: &mut dyn RemoteSession,
    upload_path: &str,
    file_name: &str,
    chroot_dir: Option<&str>,
) -> String {
    let upload_path = upload_path.trim_end_matches('/');
    let last_segment = upload_path.rsplit('/').next().unwrap_or_default();

    match chroot_dir {
        Some(dir) if !dir.is_empty() && last_segment == dir => match session.cwd(dir) {
            Ok(()) => {
                info!("  -> Changed into '{}' inside the restricted root", dir);
                file_name.to_string()
            }
            Err(e) => {
                warn!("Could not change into '{}': {}", dir, e);
                format!("{}/{}", dir, file_name)
            }
        },
        _ if upload_path.is_empty() => file_name.to_string(),
        _ => format!("{}/{}", upload_path, file_name),
    }
}

/// Result of the last upload attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    NotRun,
    /// No local file to send.
    Skipped,
    Uploaded(String),
    Failed,
}

pub struct FtpPutTasklet<'a> {
    connector: &'a dyn SessionConnector,
    local_file: PathBuf,
    upload_path: String,
    chroot_dir: Option<String>,
    outcome: RefCell<UploadOutcome>,
}

impl FtpPutTasklet<'_> {
    pub fn outcome(&self) -> UploadOutcome {
        self.outcome.borrow().clone()
    }

    fn upload(&self, session: &mut dyn RemoteSession, file_name: &str) -> Result<String, BatchError> {
        match session.pwd() {
            Ok(dir) => debug!("Remote working directory: {}", dir),
            Err(e) => debug!("Remote working directory unavailable: {}", e),
        }

        let remote_path =
            resolve_remote_path(session, &self.upload_path, file_name, self.chroot_dir.as_deref());

        info!("  -> Uploading {} to {}", file_name, remote_path);
        let start = Instant::now();

        session.put(&remote_path, &self.local_file)?;

        let local_size = fs::metadata(&self.local_file)?.len();
        let remote_size = session.size(&remote_path)?;

        if local_size != remote_size {
            return Err(BatchError::Transfer(format!(
                "size mismatch for {}: local {} bytes, remote {} bytes",
                remote_path, local_size, remote_size
            )));
        }

        info!("File uploaded: {}", remote_path);
        info!("  -> Size: {:.2} MB", local_size as f64 / 1024.0 / 1024.0);
        info!("  -> Duration: {:.2} seconds", start.elapsed().as_secs_f64());

        Ok(remote_path)
    }
}

impl Tasklet for FtpPutTasklet<'_> {
    fn execute(&self, _step_execution: &StepExecution) -> Result<RepeatStatus, BatchError> {
        if !self.local_file.exists() {
            info!(
                "No file to upload at {}, skipping",
                self.local_file.display()
            );
            *self.outcome.borrow_mut() = UploadOutcome::Skipped;
            return Ok(RepeatStatus::Finished);
        }

        let file_name = self
            .local_file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                BatchError::Configuration(format!(
                    "not a file path: {}",
                    self.local_file.display()
                ))
            })?;

        info!("Uploading {} to {}...", self.local_file.display(), self.connector.endpoint());

        let mut session = match self.connector.connect() {
            Ok(session) => session,
            Err(e) => {
                error!("Connection to {} failed: {}", self.connector.endpoint(), e);
                *self.outcome.borrow_mut() = UploadOutcome::Failed;
                return Err(e);
            }
        };

        let result = self.upload(session.as_mut(), &file_name);

        if let Err(e) = session.close() {
            debug!("Ignoring error while closing the session: {}", e);
        }

        match result {
            Ok(remote_path) => {
                *self.outcome.borrow_mut() = UploadOutcome::Uploaded(remote_path);
                Ok(RepeatStatus::Finished)
            }
            Err(e) => {
                error!("Upload failed: {}", e);
                *self.outcome.borrow_mut() = UploadOutcome::Failed;
                Err(e)
            }
        }
    }
}

#[derive(Default)]
pub struct FtpPutTaskletBuilder<'a> {
    connector: Option<&'a dyn SessionConnector>,
    local_file: Option<PathBuf>,
    upload_path: Option<String>,
    chroot_dir: Option<String>,
}

impl<'a> FtpPutTaskletBuilder<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(mut self, connector: &'a dyn SessionConnector) -> Self {
        self.connector = Some(connector);
        self
    }

    /// File to send; it does not need to exist when the tasklet is built.
    pub fn local_file<P: AsRef<Path>>(mut self, local_file: P) -> Self {
        self.local_file = Some(local_file.as_ref().to_path_buf());
        self
    }

    pub fn upload_path(mut self, upload_path: &str) -> Self {
        self.upload_path = Some(upload_path.to_string());
        self
    }

    pub fn chroot_dir(mut self, chroot_dir: &str) -> Self {
        self.chroot_dir = Some(chroot_dir.to_string()).filter(|dir| !dir.is_empty());
        self
    }

    pub fn build(self) -> Result<FtpPutTasklet<'a>, BatchError> {
        Ok(FtpPutTasklet {
            connector: self.connector.ok_or_else(|| {
                BatchError::Configuration("Session connector is required".to_string())
            })?,
            local_file: self
                .local_file
                .ok_or_else(|| BatchError::Configuration("Local file is required".to_string()))?,
            upload_path: self.upload_path.unwrap_or_default(),
            chroot_dir: self.chroot_dir,
            outcome: RefCell::new(UploadOutcome::NotRun),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use mockall::mock;
    use tempfile::NamedTempFile;

    use super::*;

    mock! {
        pub Session {}
        impl RemoteSession for Session {
            fn pwd(&mut self) -> Result<String, BatchError>;
            fn cwd(&mut self, path: &str) -> Result<(), BatchError>;
            fn put(&mut self, remote_path: &str, local: &Path) -> Result<u64, BatchError>;
            fn size(&mut self, remote_path: &str) -> Result<u64, BatchError>;
            fn close(&mut self) -> Result<(), BatchError>;
        }
    }

    /// Hands out one prepared session.
    struct OneSession {
        session: RefCell<Option<MockSession>>,
    }

    impl OneSession {
        fn new(session: MockSession) -> Self {
            Self {
                session: RefCell::new(Some(session)),
            }
        }
    }

    impl SessionConnector for OneSession {
        fn connect(&self) -> Result<Box<dyn RemoteSession>, BatchError> {
            self.session
                .borrow_mut()
                .take()
                .map(|session| Box::new(session) as Box<dyn RemoteSession>)
                .ok_or_else(|| BatchError::Transfer("refused".to_string()))
        }

        fn endpoint(&self) -> String {
            "test:21".to_string()
        }
    }

    fn export_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        file
    }

    #[test]
    fn chroot_directory_is_entered_and_bare_name_used() {
        let mut session = MockSession::new();
        session
            .expect_cwd()
            .withf(|path| path == "nimbi")
            .times(1)
            .returning(|_| Ok(()));

        let path = resolve_remote_path(&mut session, "/sftp/nimbi/", "05.csv", Some("nimbi"));

        assert_eq!(path, "05.csv");
    }

    #[test]
    fn refused_chroot_directory_falls_back_to_relative_path() {
        let mut session = MockSession::new();
        session
            .expect_cwd()
            .returning(|_| Err(BatchError::Transfer("550".to_string())));

        let path = resolve_remote_path(&mut session, "/sftp/nimbi", "05.csv", Some("nimbi"));

        assert_eq!(path, "nimbi/05.csv");
    }

    #[test]
    fn other_upload_paths_are_used_as_is() {
        let mut session = MockSession::new();
        session.expect_cwd().never();

        assert_eq!(
            resolve_remote_path(&mut session, "/incoming/", "05.csv", Some("nimbi")),
            "/incoming/05.csv"
        );
        assert_eq!(resolve_remote_path(&mut session, "", "05.csv", None), "05.csv");
    }

    #[test]
    fn upload_is_verified_and_session_closed() {
        let file = export_file("\"a\";\"b\"\n");
        let file_name = file.path().file_name().unwrap().to_string_lossy().into_owned();
        let expected_name = file_name.clone();

        let mut session = MockSession::new();
        session.expect_pwd().returning(|| Ok("/".to_string()));
        session
            .expect_put()
            .withf(move |remote, _| remote == format!("/incoming/{}", expected_name))
            .times(1)
            .returning(|_, _| Ok(8));
        session.expect_size().times(1).returning(|_| Ok(8));
        session.expect_close().times(1).returning(|| Ok(()));

        let connector = OneSession::new(session);
        let tasklet = FtpPutTaskletBuilder::new()
            .connector(&connector)
            .local_file(file.path())
            .upload_path("/incoming")
            .build()
            .unwrap();

        let result = tasklet.execute(&StepExecution::new("upload"));

        assert!(result.is_ok());
        assert_eq!(
            tasklet.outcome(),
            UploadOutcome::Uploaded(format!("/incoming/{}", file_name))
        );
    }

    #[test]
    fn size_mismatch_fails_and_still_closes() {
        let file = export_file("0123456789");

        let mut session = MockSession::new();
        session.expect_pwd().returning(|| Ok("/".to_string()));
        session.expect_put().returning(|_, _| Ok(10));
        session.expect_size().returning(|_| Ok(4));
        session
            .expect_close()
            .times(1)
            .returning(|| Err(BatchError::Transfer("already closed".to_string())));

        let connector = OneSession::new(session);
        let tasklet = FtpPutTaskletBuilder::new()
            .connector(&connector)
            .local_file(file.path())
            .build()
            .unwrap();

        let result = tasklet.execute(&StepExecution::new("upload"));

        assert!(matches!(result, Err(BatchError::Transfer(message)) if message.contains("size mismatch")));
        assert_eq!(tasklet.outcome(), UploadOutcome::Failed);
    }

    #[test]
    fn missing_local_file_skips_without_connecting() {
        let connector = OneSession {
            session: RefCell::new(None),
        };
        let tasklet = FtpPutTaskletBuilder::new()
            .connector(&connector)
            .local_file("/definitely/not/here.csv")
            .build()
            .unwrap();

        assert!(tasklet.execute(&StepExecution::new("upload")).is_ok());
        assert_eq!(tasklet.outcome(), UploadOutcome::Skipped);
    }

    #[test]
    fn connection_failure_is_an_error() {
        let file = export_file("x");
        let connector = OneSession {
            session: RefCell::new(None),
        };
        let tasklet = FtpPutTaskletBuilder::new()
            .connector(&connector)
            .local_file(file.path())
            .build()
            .unwrap();

        assert!(tasklet.execute(&StepExecution::new("upload")).is_err());
        assert_eq!(tasklet.outcome(), UploadOutcome::Failed);
    }
}
