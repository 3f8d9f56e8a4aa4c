//! Advisory single-writer locks, one per dataset level.
//!
//! A lock is a small JSON file at `<root>/_locks/<dataset>.lock`. Entering a
//! session creates it with create-only-if-new semantics, so two processes
//! racing on [`AccessGuard::enter`] cannot both succeed: the loser gets
//! [`GuardError::LockConflict`]. The lock is advisory; nothing stops a
//! writer that never asks for it.
//!
//! Sessions release their lock on every exit path. [`AccessSession::release`]
//! removes the file and reports failures; dropping an unreleased session
//! (error propagation, panic unwinding) removes it on a best-effort basis.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tracing::{debug, warn};

use crate::storage::{self, StorageError, TableLocation};

/// Directory under the store root holding lock files.
pub const LOCK_DIR_NAME: &str = "_locks";

/// Errors from lock handling.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum GuardError {
    /// Another session holds the dataset.
    #[snafu(display("Dataset {dataset} is already locked{}", holder_suffix(holder)))]
    LockConflict {
        /// Dataset name.
        dataset: String,
        /// Lock holder, when the lock file could be read.
        holder: Option<LockInfo>,
    },

    /// Creating, reading or removing a lock file failed.
    #[snafu(display("Lock storage error for {dataset}: {source}"))]
    Storage {
        /// Dataset name.
        dataset: String,
        /// Underlying storage error.
        source: StorageError,
    },
}

fn holder_suffix(holder: &Option<LockInfo>) -> String {
    match holder {
        Some(info) => format!(" by pid {} since {}", info.pid, info.acquired_at),
        None => String::new(),
    }
}

/// Contents of a lock file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Locked dataset.
    pub dataset: String,
    /// Process that took the lock.
    pub pid: u32,
    /// When the lock was taken.
    pub acquired_at: DateTime<Utc>,
}

/// Lock manager rooted at a store directory.
#[derive(Clone, Debug)]
pub struct AccessGuard {
    root: TableLocation,
}

impl AccessGuard {
    /// Guard for the store at `root`.
    pub fn new(root: TableLocation) -> Self {
        Self { root }
    }

    fn lock_rel_path(dataset: &str) -> PathBuf {
        Path::new(LOCK_DIR_NAME).join(format!("{dataset}.lock"))
    }

    /// Take the lock for `dataset`.
    pub async fn enter(&self, dataset: &str) -> Result<AccessSession, GuardError> {
        let info = LockInfo {
            dataset: dataset.to_string(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let json = serde_json::to_vec(&info).unwrap_or_default();

        match storage::write_new(&self.root, &Self::lock_rel_path(dataset), &json).await {
            Ok(()) => {
                debug!(dataset, "acquired lock");
                Ok(AccessSession {
                    path: self.root.resolve(&Self::lock_rel_path(dataset)),
                    guard: self.clone(),
                    dataset: dataset.to_string(),
                    released: false,
                })
            }
            Err(StorageError::AlreadyExists { .. }) => {
                let holder = self.lock_info(dataset).await.ok().flatten();
                LockConflictSnafu { dataset, holder }.fail()
            }
            Err(source) => Err(GuardError::Storage {
                dataset: dataset.to_string(),
                source,
            }),
        }
    }

    /// Clear the lock for `dataset` unconditionally.
    pub async fn exit(&self, dataset: &str) -> Result<(), GuardError> {
        storage::remove_file(&self.root, &Self::lock_rel_path(dataset))
            .await
            .context(StorageSnafu { dataset })?;
        debug!(dataset, "released lock");
        Ok(())
    }

    /// Whether `dataset` is currently locked.
    pub async fn is_locked(&self, dataset: &str) -> Result<bool, GuardError> {
        storage::exists(&self.root, &Self::lock_rel_path(dataset))
            .await
            .context(StorageSnafu { dataset })
    }

    /// Holder of the lock for `dataset`, if any.
    ///
    /// A lock file that cannot be parsed still counts as held; it reads as
    /// `Some` with pid 0 and the Unix epoch as acquisition time.
    pub async fn lock_info(&self, dataset: &str) -> Result<Option<LockInfo>, GuardError> {
        match storage::read_to_string(&self.root, &Self::lock_rel_path(dataset)).await {
            Ok(json) => Ok(Some(serde_json::from_str(&json).unwrap_or(LockInfo {
                dataset: dataset.to_string(),
                pid: 0,
                acquired_at: DateTime::UNIX_EPOCH,
            }))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(source) => Err(GuardError::Storage {
                dataset: dataset.to_string(),
                source,
            }),
        }
    }

    /// Every held lock, ordered by dataset name.
    pub async fn held_locks(&self) -> Result<Vec<LockInfo>, GuardError> {
        let names = storage::list_file_names(&self.root, Path::new(LOCK_DIR_NAME))
            .await
            .context(StorageSnafu {
                dataset: LOCK_DIR_NAME,
            })?;

        let mut held = Vec::new();
        for name in names {
            let Some(dataset) = name.strip_suffix(".lock") else {
                continue;
            };
            if let Some(info) = self.lock_info(dataset).await? {
                held.push(info);
            }
        }
        Ok(held)
    }

    /// Remove a stale lock left by a crashed process. Returns whether a
    /// lock was present.
    pub async fn force_unlock(&self, dataset: &str) -> Result<bool, GuardError> {
        let held = self.is_locked(dataset).await?;
        if held {
            warn!(dataset, "forcibly clearing lock");
            self.exit(dataset).await?;
        }
        Ok(held)
    }
}

/// A held lock. Released by [`AccessSession::release`] or on drop.
#[derive(Debug)]
pub struct AccessSession {
    guard: AccessGuard,
    dataset: String,
    path: PathBuf,
    released: bool,
}

impl AccessSession {
    /// Locked dataset.
    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Release the lock.
    pub async fn release(mut self) -> Result<(), GuardError> {
        self.released = true;
        self.guard.exit(&self.dataset).await
    }
}

impl Drop for AccessSession {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(dataset = %self.dataset, "released lock on drop"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(dataset = %self.dataset, error = %e, "failed to release lock on drop"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn guard(tmp: &TempDir) -> AccessGuard {
        AccessGuard::new(TableLocation::local(tmp.path()))
    }

    #[tokio::test]
    async fn second_enter_conflicts_until_exit() -> TestResult {
        let tmp = TempDir::new()?;
        let guard = guard(&tmp);

        let session = guard.enter("daily_quote").await?;
        let err = guard.enter("daily_quote").await.expect_err("conflict");
        match err {
            GuardError::LockConflict { dataset, holder } => {
                assert_eq!(dataset, "daily_quote");
                assert_eq!(holder.map(|h| h.pid), Some(std::process::id()));
            }
            other => panic!("expected LockConflict, got {other:?}"),
        }

        session.release().await?;
        assert!(!guard.is_locked("daily_quote").await?);
        guard.enter("daily_quote").await?.release().await?;
        Ok(())
    }

    #[tokio::test]
    async fn locks_are_per_dataset() -> TestResult {
        let tmp = TempDir::new()?;
        let guard = guard(&tmp);

        let _a = guard.enter("daily_quote").await?;
        let _b = guard.enter("report").await?;
        let held: Vec<String> = guard
            .held_locks()
            .await?
            .into_iter()
            .map(|i| i.dataset)
            .collect();
        assert_eq!(held, vec!["daily_quote", "report"]);
        Ok(())
    }

    #[tokio::test]
    async fn dropping_a_session_releases_the_lock() -> TestResult {
        let tmp = TempDir::new()?;
        let guard = guard(&tmp);

        {
            let _session = guard.enter("daily_quote").await?;
            assert!(guard.is_locked("daily_quote").await?);
        }
        assert!(!guard.is_locked("daily_quote").await?);
        Ok(())
    }

    #[tokio::test]
    async fn force_unlock_clears_stale_locks() -> TestResult {
        let tmp = TempDir::new()?;
        let guard = guard(&tmp);

        let session = guard.enter("daily_quote").await?;
        std::mem::forget(session);

        assert!(guard.force_unlock("daily_quote").await?);
        assert!(!guard.force_unlock("daily_quote").await?);
        guard.exit("daily_quote").await?;
        assert!(guard.held_locks().await?.is_empty());
        Ok(())
    }
}
