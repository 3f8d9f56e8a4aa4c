//! Filesystem layout and atomic file helpers.
//!
//! Everything that touches the disk goes through this module. A store root
//! holds one directory per dataset level plus a `_locks/` directory used by
//! the access guard:
//!
//! - `<root>/<level>/_table_log/` holds the commit log for the level.
//! - `<root>/<level>/data/` holds Parquet row segments.
//! - `<root>/<level>/record.json` and `<root>/<level>/refresh_time.json`
//!   hold the derived per-entity ledgers.
//! - `<root>/_locks/<level>.lock` marks a level as in use.
//!
//! The helpers here provide the small set of primitives the commit protocol
//! and the ledgers rely on: write-then-rename replacement, create-only-if-new
//! writes, and reads that classify "not found" separately from other I/O
//! failures so callers can treat a missing file as an empty state.

use snafu::{Backtrace, prelude::*};
use std::{
    error::Error,
    fmt, io,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};

/// General result type used by storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Represents the location of a store or of one level inside it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TableLocation {
    /// A directory on the local filesystem.
    Local(PathBuf),
}

impl TableLocation {
    /// Creates a new `TableLocation` for a local filesystem path.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        TableLocation::Local(root.into())
    }

    /// Location of a child directory, used to derive per-level locations
    /// from the store root.
    pub fn child(&self, name: &str) -> Self {
        match self {
            TableLocation::Local(root) => TableLocation::Local(root.join(name)),
        }
    }

    /// Absolute path of a file relative to this location.
    pub fn resolve(&self, rel: &Path) -> PathBuf {
        join_local(self, rel)
    }
}

/// Errors produced by the storage backend implementation.
///
/// Only the local filesystem is supported; backend-specific I/O errors are
/// wrapped here so that [`StorageError`] can attach path context.
#[derive(Debug)]
pub enum BackendError {
    /// A local filesystem I/O error.
    Local(io::Error),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Local(e) => write!(f, "local I/O error: {e}"),
        }
    }
}

impl Error for BackendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BackendError::Local(e) => Some(e),
        }
    }
}

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    /// The specified path was not found.
    #[snafu(display("Path not found: {path}"))]
    NotFound {
        /// The path that was not found.
        path: String,
        /// Underlying backend error that caused the failure.
        source: BackendError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The specified path already exists when creation was requested with
    /// create-new semantics.
    #[snafu(display("Path already exists: {path}"))]
    AlreadyExists {
        /// The path that was found to already exist.
        path: String,
        /// Underlying backend error that indicates the existing resource.
        source: BackendError,
        /// The backtrace captured when the error occurred.
        backtrace: Backtrace,
    },

    /// An I/O error occurred on the local filesystem.
    #[snafu(display("Local I/O error at {path}: {source}"))]
    OtherIo {
        /// The path where the I/O error occurred.
        path: String,
        /// Underlying backend I/O error with platform-specific details.
        source: BackendError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}

impl StorageError {
    /// True when the error means the target file does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

fn join_local(location: &TableLocation, rel: &Path) -> PathBuf {
    match location {
        TableLocation::Local(root) => root.join(rel),
    }
}

fn classify(e: io::Error, path: String) -> StorageError {
    match e.kind() {
        io::ErrorKind::NotFound => StorageError::NotFound {
            path,
            source: BackendError::Local(e),
            backtrace: Backtrace::capture(),
        },
        io::ErrorKind::AlreadyExists => StorageError::AlreadyExists {
            path,
            source: BackendError::Local(e),
            backtrace: Backtrace::capture(),
        },
        _ => StorageError::OtherIo {
            path,
            source: BackendError::Local(e),
            backtrace: Backtrace::capture(),
        },
    }
}

async fn create_parent_dir(abs: &Path) -> StorageResult<()> {
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: parent.display().to_string(),
            })?;
    }
    Ok(())
}

/// Removes a temporary file on drop unless disarmed.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Write `contents` to `rel_path` inside `location`, replacing any existing
/// file atomically.
///
/// The payload goes to a sibling temporary file which is synced and then
/// renamed over the target, so readers observe either the old or the new
/// contents and never a torn write.
pub async fn write_atomic(
    location: &TableLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = join_local(location, rel_path);
    create_parent_dir(&abs).await?;

    let tmp_path = abs.with_extension("tmp");
    let mut guard = TempFileGuard::new(tmp_path.clone());

    {
        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: tmp_path.display().to_string(),
            })?;

        file.write_all(contents)
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: tmp_path.display().to_string(),
            })?;

        file.sync_all()
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: tmp_path.display().to_string(),
            })?;
    }

    fs::rename(&tmp_path, &abs)
        .await
        .map_err(BackendError::Local)
        .context(OtherIoSnafu {
            path: abs.display().to_string(),
        })?;

    guard.disarm();
    Ok(())
}

/// Create a *new* file at `rel_path` and write `contents`, failing with
/// [`StorageError::AlreadyExists`] if the file is already there.
///
/// Commit files and lock files rely on this for their exactly-once creation.
pub async fn write_new(
    location: &TableLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = join_local(location, rel_path);
    create_parent_dir(&abs).await?;

    let path_str = abs.display().to_string();

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&abs)
        .await
        .map_err(|e| classify(e, path_str.clone()))?;

    file.write_all(contents)
        .await
        .map_err(BackendError::Local)
        .context(OtherIoSnafu {
            path: path_str.clone(),
        })?;

    file.sync_all()
        .await
        .map_err(BackendError::Local)
        .context(OtherIoSnafu { path: path_str })?;

    Ok(())
}

/// Read the file at `rel_path` as UTF-8 text.
///
/// A missing file yields [`StorageError::NotFound`]; anything else is
/// reported as [`StorageError::OtherIo`].
pub async fn read_to_string(location: &TableLocation, rel_path: &Path) -> StorageResult<String> {
    let abs = join_local(location, rel_path);
    fs::read_to_string(&abs)
        .await
        .map_err(|e| classify(e, abs.display().to_string()))
}

/// Read the full contents of the file at `rel_path` into memory.
pub async fn read_all_bytes(location: &TableLocation, rel_path: &Path) -> StorageResult<Vec<u8>> {
    let abs = join_local(location, rel_path);
    fs::read(&abs)
        .await
        .map_err(|e| classify(e, abs.display().to_string()))
}

/// Remove the file at `rel_path`. A file that is already gone is not an error.
pub async fn remove_file(location: &TableLocation, rel_path: &Path) -> StorageResult<()> {
    let abs = join_local(location, rel_path);
    match fs::remove_file(&abs).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(classify(e, abs.display().to_string())),
    }
}

/// Whether a file or directory exists at `rel_path`.
pub async fn exists(location: &TableLocation, rel_path: &Path) -> StorageResult<bool> {
    let abs = join_local(location, rel_path);
    fs::try_exists(&abs)
        .await
        .map_err(|e| classify(e, abs.display().to_string()))
}

/// File names directly under `rel_dir`, sorted. A missing directory lists as empty.
pub async fn list_file_names(
    location: &TableLocation,
    rel_dir: &Path,
) -> StorageResult<Vec<String>> {
    let abs = join_local(location, rel_dir);
    let mut entries = match fs::read_dir(&abs).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(classify(e, abs.display().to_string())),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| classify(e, abs.display().to_string()))?
    {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}
