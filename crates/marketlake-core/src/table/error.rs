//! Error types and SNAFU context selectors for the table store.
//!
//! `TableError` layers on top of [`CommitError`] and [`StorageError`] and
//! carries the store-level taxonomy: schema mismatches, missing tables and
//! invalid predicates. Sibling modules attach context through the
//! `pub(crate)` selectors.

use arrow::error::ArrowError;
use parquet::errors::ParquetError;
use snafu::prelude::*;

use crate::{
    dataset::DatasetError, predicate::PredicateError, storage::StorageError,
    transaction_log::CommitError,
};

/// Errors from table store operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TableError {
    /// Any error coming from the commit log (conflicts, storage failures or
    /// corrupt commits).
    #[snafu(display("Transaction log error: {source}"))]
    TransactionLog {
        /// Underlying commit error.
        #[snafu(source, backtrace)]
        source: CommitError,
    },

    /// Storage error while reading or writing segment files.
    #[snafu(display("Storage error while accessing table data: {source}"))]
    Storage {
        /// Underlying storage error.
        source: StorageError,
    },

    /// The level is not registered.
    #[snafu(display("{source}"))]
    Dataset {
        /// Underlying registry error.
        source: DatasetError,
    },

    /// The level has never been written.
    #[snafu(display("Table {level} does not exist"))]
    MissingTable {
        /// Level name.
        level: String,
    },

    /// Rows or a request do not fit the level's schema.
    #[snafu(display("Schema mismatch in {level}, column {column}: {reason}"))]
    SchemaMismatch {
        /// Level name.
        level: String,
        /// Offending column.
        column: String,
        /// What is wrong.
        reason: String,
    },

    /// A query predicate is malformed or names an invalid code.
    #[snafu(display("Invalid predicate: {source}"))]
    InvalidPredicate {
        /// Underlying parse or validation error.
        source: PredicateError,
    },

    /// Encoding a segment to Parquet failed.
    #[snafu(display("Parquet write error for {path}: {source}"))]
    ParquetWrite {
        /// Segment path relative to the level directory.
        path: String,
        /// Underlying Parquet error.
        source: ParquetError,
    },

    /// Decoding a segment from Parquet failed.
    #[snafu(display("Parquet read error for {path}: {source}"))]
    ParquetRead {
        /// Segment path relative to the level directory.
        path: String,
        /// Underlying Parquet error.
        source: ParquetError,
    },

    /// Arrow conversion failed while building or reading a batch.
    #[snafu(display("Arrow error: {source}"))]
    Arrow {
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// A segment column does not have the type the table metadata declares.
    #[snafu(display("Segment {path} column {column} has unexpected type {found}"))]
    CorruptSegment {
        /// Segment path relative to the level directory.
        path: String,
        /// Column name.
        column: String,
        /// Arrow type found in the file.
        found: String,
    },
}

impl TableError {
    /// True when the level has never been written. Callers that treat an
    /// absent table as empty match on this.
    pub fn is_missing_table(&self) -> bool {
        matches!(self, TableError::MissingTable { .. })
    }
}
