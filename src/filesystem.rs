//! Filesystem gateway.
//!
//! All file system access goes through this module. Paths coming from
//! clients are resolved against a base directory (the connection's working
//! directory), and every failure is reported as an [`FsError`] that names
//! the client-supplied path rather than the absolute server path.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Typed outcome of a failed filesystem operation.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("{0}: no such file or directory")]
    PathNotFound(String),

    #[error("{0} is a directory, not a file")]
    NotAFile(String),

    #[error("{0} is not a directory")]
    NotADirectory(String),

    #[error("{0} is not a regular file")]
    NotRegularFile(String),

    #[error("{path}: {source}")]
    OperationFailed {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl FsError {
    fn from_io(display: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => FsError::PathNotFound(display.to_string()),
            _ => FsError::OperationFailed {
                path: display.to_string(),
                source: err,
            },
        }
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub name: String,
    pub is_dir: bool,
    /// Size in bytes; zero for directories.
    pub size: u64,
}

/// Resolve `rel` against `base` without touching the file system.
pub fn resolve(base: &Path, rel: &str) -> PathBuf {
    base.join(rel)
}

/// List the entries of `dir`, sorted by name.
pub fn list(dir: &Path) -> Result<Vec<EntryInfo>, FsError> {
    let reader = fs::read_dir(dir).map_err(|e| FsError::from_io(".", e))?;

    let mut entries = Vec::new();
    for entry in reader {
        let entry = entry.map_err(|e| FsError::from_io(".", e))?;
        let name = entry.file_name().to_string_lossy().into_owned();

        // Follow symlinks; a dangling link is described by the link itself.
        let metadata = match fs::metadata(entry.path()) {
            Ok(m) => m,
            Err(_) => entry
                .metadata()
                .map_err(|e| FsError::from_io(&name, e))?,
        };

        let is_dir = metadata.is_dir();
        entries.push(EntryInfo {
            name,
            is_dir,
            size: if is_dir { 0 } else { metadata.len() },
        });
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// Read the whole contents of a regular file.
///
/// FIFOs, sockets and devices are rejected before they are opened, since
/// opening or reading them may block or never end.
pub fn read_file(base: &Path, rel: &str) -> Result<Vec<u8>, FsError> {
    let path = resolve(base, rel);
    let metadata = fs::metadata(&path).map_err(|e| FsError::from_io(rel, e))?;
    if metadata.is_dir() {
        return Err(FsError::NotAFile(rel.to_string()));
    }
    if !metadata.is_file() {
        return Err(FsError::NotRegularFile(rel.to_string()));
    }
    fs::read(&path).map_err(|e| FsError::from_io(rel, e))
}

/// Resolve `rel` to the canonical path of an existing directory.
pub fn resolve_directory(base: &Path, rel: &str) -> Result<PathBuf, FsError> {
    let path = resolve(base, rel);
    match fs::metadata(&path) {
        Ok(m) if m.is_dir() => {
            fs::canonicalize(&path).map_err(|e| FsError::from_io(rel, e))
        }
        _ => Err(FsError::NotADirectory(rel.to_string())),
    }
}

/// Create a directory and any missing parents.
pub fn create_directory(base: &Path, rel: &str) -> Result<(), FsError> {
    fs::create_dir_all(resolve(base, rel)).map_err(|e| FsError::OperationFailed {
        path: rel.to_string(),
        source: e,
    })
}

/// Create an empty file if it does not exist yet.
///
/// An existing file is left untouched, so repeated calls succeed without
/// altering its contents.
pub fn create_file(base: &Path, rel: &str) -> Result<(), FsError> {
    OpenOptions::new()
        .append(true)
        .create(true)
        .open(resolve(base, rel))
        .map(|_| ())
        .map_err(|e| FsError::from_io(rel, e))
}

pub fn exists(base: &Path, rel: &str) -> bool {
    resolve(base, rel).exists()
}

pub fn is_directory(base: &Path, rel: &str) -> bool {
    resolve(base, rel).is_dir()
}
