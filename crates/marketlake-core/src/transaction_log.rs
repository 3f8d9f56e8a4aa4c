//! Append-only commit log for one dataset level.
//!
//! Each level keeps its row table as a set of immutable Parquet segments
//! whose membership is tracked by a small JSON commit log:
//!
//! ```text
//! <root>/<level>/
//!   _table_log/
//!     CURRENT                  # latest committed version (e.g. "3\n")
//!     0000000001.json          # Commit version 1
//!     0000000002.json          # Commit version 2
//!   data/
//!     seg-0000000002-0000-1a2b3c4d.parquet
//! ```
//!
//! Every mutation of the table (append, removal, replacement, rewrite,
//! attribute update) is expressed as one [`Commit`] holding an ordered list
//! of [`LogAction`]s. A commit becomes visible only once `CURRENT` points at
//! it, so an interrupted mutation leaves the previous table state intact;
//! segment files written by an abandoned commit are simply never referenced.
//!
//! [`TableState`] is reconstructed by replaying commits from version 1 up to
//! `CURRENT`. Writers guard their commit with the version they started from
//! (optimistic concurrency), and commit files are created with
//! create-only-if-new semantics so a version can only ever be written once.
pub mod actions;
pub mod log_store;
pub mod segments;
pub mod table_state;

pub use actions::{Commit, LogAction, TableMeta};
pub use log_store::TransactionLogStore;
pub use segments::{SegmentId, SegmentMeta};
pub use table_state::TableState;

use snafu::{Backtrace, prelude::*};

use crate::storage::StorageError;

/// Errors that can occur while reading or writing the commit log.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CommitError {
    /// The caller's expected version does not match the CURRENT pointer.
    #[snafu(display("Commit conflict: expected version {expected}, but CURRENT is {found}"))]
    Conflict {
        /// The version the caller expected to be current.
        expected: u64,
        /// The actual current version found.
        found: u64,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Underlying storage error while working with the log or CURRENT file.
    #[snafu(display("Storage error while accessing commit log: {source}"))]
    Storage {
        /// Underlying storage error returned by the storage backend.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// The log or CURRENT file is in an unexpected / malformed state.
    #[snafu(display("Corrupt log state: {msg}"))]
    CorruptState {
        /// A description of the corrupt state.
        msg: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },
}
