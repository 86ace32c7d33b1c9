//! # Tasklet Module
//!
//! Single-task steps that run around the chunk-oriented load: exporting the
//! destination table, repairing the exported file and uploading it.

/// Export of a loaded table as a delimited file.
pub mod export;

/// Upload of a local file to a remote server, with the FTP(S) transport.
pub mod ftp;

/// In-place repairs of exported files.
pub mod repair;

/// SFTP transport for the upload.
pub mod sftp;
