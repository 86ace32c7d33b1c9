//! # SFTP transport
//!
//! [`SessionConnector`] over SSH with password authentication. SFTP has no
//! working directory of its own, so the session keeps one and resolves
//! relative paths against it; it starts at the login directory, which is `/`
//! on servers that jail the account in a `ChrootDirectory`.
//!
//! ```rust,no_run
//! use warehouse_batch::tasklet::{ftp::FtpPutTaskletBuilder, sftp::SftpConnector};
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), warehouse_batch::BatchError> {
//! let connector = SftpConnector::new("sftp.example.com", 22, "nimbi", "password")
//!     .timeout(Duration::from_secs(600));
//!
//! let tasklet = FtpPutTaskletBuilder::new()
//!     .connector(&connector)
//!     .local_file("./temp_csv/05_beneficios_alumnos.csv")
//!     .upload_path("/sftp/nimbi/")
//!     .chroot_dir("nimbi")
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use std::{
    fs::File,
    io,
    net::TcpStream,
    path::Path,
    time::Duration,
};

use log::{debug, info};
use ssh2::{Session, Sftp};

use crate::{
    tasklet::ftp::{socket_addr, transfer_error, RemoteSession, SessionConnector},
    BatchError,
};

/// Joins a remote path onto a directory; absolute paths are kept.
fn join_remote(dir: &str, path: &str) -> String {
    if path.starts_with('/') || dir.is_empty() || dir == "." {
        path.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), path)
    }
}

/// An authenticated SFTP channel.
pub struct SftpSession {
    session: Option<Session>,
    sftp: Option<Sftp>,
    cwd: String,
}

impl SftpSession {
    fn sftp(&self) -> Result<&Sftp, BatchError> {
        self.sftp
            .as_ref()
            .ok_or_else(|| BatchError::Transfer("session already closed".to_string()))
    }

    fn absolute(&self, path: &str) -> String {
        join_remote(&self.cwd, path)
    }
}

impl RemoteSession for SftpSession {
    fn pwd(&mut self) -> Result<String, BatchError> {
        self.sftp()?;
        Ok(self.cwd.clone())
    }

    fn cwd(&mut self, path: &str) -> Result<(), BatchError> {
        let target = self.absolute(path);
        let sftp = self.sftp()?;

        let stat = sftp
            .stat(Path::new(&target))
            .map_err(|e| transfer_error(&format!("stat {}", target), e))?;
        if !stat.is_dir() {
            return Err(BatchError::Transfer(format!("{} is not a directory", target)));
        }

        let resolved = sftp
            .realpath(Path::new(&target))
            .map(|path| path.to_string_lossy().into_owned())
            .unwrap_or(target);

        debug!("Remote directory is now {}", resolved);
        self.cwd = resolved;
        Ok(())
    }

    fn put(&mut self, remote_path: &str, local: &Path) -> Result<u64, BatchError> {
        let target = self.absolute(remote_path);
        let mut source = File::open(local)?;

        let mut remote = self
            .sftp()?
            .create(Path::new(&target))
            .map_err(|e| transfer_error(&format!("create {}", target), e))?;
        let sent = io::copy(&mut source, &mut remote)
            .map_err(|e| transfer_error(&format!("upload {}", target), e))?;
        drop(remote);

        Ok(sent)
    }

    fn size(&mut self, remote_path: &str) -> Result<u64, BatchError> {
        let target = self.absolute(remote_path);

        self.sftp()?
            .stat(Path::new(&target))
            .map_err(|e| transfer_error(&format!("stat {}", target), e))?
            .size
            .ok_or_else(|| BatchError::Transfer(format!("no size reported for {}", target)))
    }

    fn close(&mut self) -> Result<(), BatchError> {
        self.sftp.take();

        match self.session.take() {
            Some(session) => session
                .disconnect(None, "upload finished", None)
                .map_err(|e| transfer_error("disconnect", e)),
            None => Ok(()),
        }
    }
}

/// Connection settings of the SFTP server.
pub struct SftpConnector {
    host: String,
    port: u16,
    username: String,
    password: String,
    timeout: Duration,
}

impl SftpConnector {
    pub fn new(host: &str, port: u16, username: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            username: username.to_string(),
            password: password.to_string(),
            timeout: Duration::from_secs(600),
        }
    }

    /// Connect timeout, also applied to every blocking SSH call.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl SessionConnector for SftpConnector {
    fn connect(&self) -> Result<Box<dyn RemoteSession>, BatchError> {
        info!("Connecting to {}...", self.endpoint());

        let tcp = TcpStream::connect_timeout(&socket_addr(&self.host, self.port)?, self.timeout)
            .map_err(|e| transfer_error("connect", e))?;
        tcp.set_read_timeout(Some(self.timeout))?;
        tcp.set_write_timeout(Some(self.timeout))?;

        let mut session = Session::new().map_err(|e| transfer_error("SSH setup", e))?;
        session.set_timeout(u32::try_from(self.timeout.as_millis()).unwrap_or(u32::MAX));
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| transfer_error("SSH handshake", e))?;
        session
            .userauth_password(&self.username, &self.password)
            .map_err(|e| transfer_error("login", e))?;
        if !session.authenticated() {
            return Err(BatchError::Transfer(format!(
                "login: {} was not accepted",
                self.username
            )));
        }

        let sftp = session.sftp().map_err(|e| transfer_error("SFTP channel", e))?;
        let cwd = sftp
            .realpath(Path::new("."))
            .map(|path| path.to_string_lossy().into_owned())
            .map_err(|e| transfer_error("realpath", e))?;

        info!("Connected to {} (directory {})", self.endpoint(), cwd);
        Ok(Box::new(SftpSession {
            session: Some(session),
            sftp: Some(sftp),
            cwd,
        }))
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn relative_paths_follow_the_session_directory() {
        assert_eq!(join_remote("/", "nimbi"), "/nimbi");
        assert_eq!(join_remote("/nimbi/", "05.csv"), "/nimbi/05.csv");
        assert_eq!(join_remote("/home/etl", "nimbi/05.csv"), "/home/etl/nimbi/05.csv");
        assert_eq!(join_remote("/nimbi", "/sftp/nimbi/05.csv"), "/sftp/nimbi/05.csv");
        assert_eq!(join_remote(".", "05.csv"), "05.csv");
        assert_eq!(join_remote("", "05.csv"), "05.csv");
    }

    #[test]
    fn refused_connection_is_a_transfer_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let connector = SftpConnector::new("127.0.0.1", port, "nimbi", "secret")
            .timeout(Duration::from_secs(2));

        assert_eq!(connector.endpoint(), format!("127.0.0.1:{}", port));
        assert!(matches!(connector.connect(), Err(BatchError::Transfer(_))));
    }

    #[test]
    fn peer_that_is_not_ssh_fails_the_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            if let Ok((mut socket, _)) = listener.accept() {
                use std::io::Write;
                let _ = socket.write_all(b"220 not an ssh server\r\n");
            }
        });

        let connector = SftpConnector::new("127.0.0.1", port, "nimbi", "secret")
            .timeout(Duration::from_secs(2));

        assert!(matches!(connector.connect(), Err(BatchError::Transfer(_))));
        server.join().unwrap();
    }
}
