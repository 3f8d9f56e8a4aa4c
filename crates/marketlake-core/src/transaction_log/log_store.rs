//! Async helpers for persisting and reading the commit log.
//!
//! This module owns all on-disk interactions with `_table_log/`:
//! - Tracking the `CURRENT` pointer and interpreting the "no file" case as
//!   version `0` (table never written).
//! - Writing zero-padded commit files with optimistic concurrency control so
//!   each version is created exactly once.
//! - Mapping storage-layer failures into [`CommitError`] variants so callers
//!   can differentiate between conflicts, storage errors, and corrupt state.
use crate::storage::{self, StorageError, TableLocation};
use crate::transaction_log::actions::{Commit, LogAction};
use crate::transaction_log::*;
use chrono::Utc;
use snafu::{Backtrace, prelude::*};
use std::path::{Path, PathBuf};

/// Reads and writes the commit log under a level directory.
///
/// Layout:
///   <level>/_table_log/0000000001.json
///   <level>/_table_log/0000000002.json
///   <level>/_table_log/CURRENT
#[derive(Debug, Clone)]
pub struct TransactionLogStore {
    location: TableLocation,
}

impl TransactionLogStore {
    /// Name of the subdirectory containing the commit log.
    pub const LOG_DIR_NAME: &str = "_table_log";
    /// Name of the file that stores the current version pointer.
    pub const CURRENT_FILE_NAME: &str = "CURRENT";
    /// Number of digits used in zero-padded commit file names.
    pub const COMMIT_FILENAME_DIGITS: usize = 10;

    /// Log store rooted at a level directory.
    pub fn new(location: TableLocation) -> Self {
        Self { location }
    }

    /// Level directory this log lives in.
    pub fn location(&self) -> &TableLocation {
        &self.location
    }

    fn log_rel_dir() -> PathBuf {
        PathBuf::from(Self::LOG_DIR_NAME)
    }

    fn current_rel_path() -> PathBuf {
        Self::log_rel_dir().join(Self::CURRENT_FILE_NAME)
    }

    fn commit_rel_path(version: u64) -> PathBuf {
        let file_name = format!(
            "{:0width$}.json",
            version,
            width = Self::COMMIT_FILENAME_DIGITS
        );
        Self::log_rel_dir().join(file_name)
    }

    async fn read_to_string_rel(&self, rel: &Path) -> Result<String, CommitError> {
        storage::read_to_string(&self.location, rel)
            .await
            .context(StorageSnafu)
    }

    /// Load a single commit by version.
    ///
    /// - On storage-layer failures, returns `CommitError::Storage`.
    /// - On JSON parse failures, returns `CommitError::CorruptState`.
    pub async fn load_commit(&self, version: u64) -> Result<Commit, CommitError> {
        let rel = Self::commit_rel_path(version);
        let json = self.read_to_string_rel(&rel).await?;

        serde_json::from_str(&json).map_err(|e| CommitError::CorruptState {
            msg: format!("failed to parse commit {version}: {e}"),
            backtrace: Backtrace::capture(),
        })
    }

    /// Load the CURRENT version pointer.
    ///
    /// A missing CURRENT file means the table was never written and reads
    /// as version 0; empty or non-numeric content is `CorruptState`.
    pub async fn load_current_version(&self) -> Result<u64, CommitError> {
        let rel = Self::current_rel_path();

        let contents = match storage::read_to_string(&self.location, &rel).await {
            Ok(s) => s,
            Err(StorageError::NotFound { .. }) => return Ok(0),
            Err(source) => return Err(CommitError::Storage { source }),
        };

        let trimmed = contents.trim();
        ensure!(
            !trimmed.is_empty(),
            CorruptStateSnafu {
                msg: format!("CURRENT has empty content at {rel:?}"),
            }
        );

        trimmed
            .parse::<u64>()
            .map_err(|e| CommitError::CorruptState {
                msg: format!("CURRENT has invalid content {trimmed:?}: {e}"),
                backtrace: Backtrace::capture(),
            })
    }

    /// Commit a new version with an optimistic concurrency guard.
    ///
    /// 1. Load CURRENT; if it differs from `expected`, fail with `Conflict`.
    /// 2. Create `_table_log/<expected + 1>.json` with create-only-if-new
    ///    semantics. A writer that lost the race gets
    ///    `StorageError::AlreadyExists` wrapped in `CommitError::Storage`.
    /// 3. Atomically rewrite CURRENT to the new version.
    ///
    /// If the process dies between steps 2 and 3 the commit file is orphaned
    /// and ignored by readers, since they only replay up to CURRENT.
    pub async fn commit_with_expected_version(
        &self,
        expected: u64,
        actions: Vec<LogAction>,
    ) -> Result<u64, CommitError> {
        let current = self.load_current_version().await?;
        ensure!(
            current == expected,
            ConflictSnafu {
                expected,
                found: current,
            }
        );

        let version = expected.checked_add(1).context(CorruptStateSnafu {
            msg: "version counter overflow".to_string(),
        })?;

        let commit = Commit {
            version,
            base_version: expected,
            timestamp: Utc::now(),
            actions,
        };

        let json = serde_json::to_vec_pretty(&commit).map_err(|e| CommitError::CorruptState {
            msg: format!("failed to serialize commit {version}: {e}"),
            backtrace: Backtrace::capture(),
        })?;

        let commit_rel = Self::commit_rel_path(version);
        storage::write_new(&self.location, &commit_rel, &json)
            .await
            .context(StorageSnafu)?;

        let current_contents = format!("{version}\n");
        storage::write_atomic(
            &self.location,
            &Self::current_rel_path(),
            current_contents.as_bytes(),
        )
        .await
        .context(StorageSnafu)?;

        Ok(version)
    }
}
