//! Log actions and commit payload definitions.
//!
//! Each commit file stores a [`Commit`] containing ordered [`LogAction`]
//! values: bootstrapping or widening table metadata, adding and removing
//! segments, and setting table attributes.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dataset::{ColumnSpec, DatasetDescriptor};
use crate::transaction_log::segments::{SegmentId, SegmentMeta};

/// Table-level metadata recorded in the log.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableMeta {
    /// Level name the table belongs to.
    pub dataset: String,
    /// Ordered schema the segments were written with.
    pub columns: Vec<ColumnSpec>,
    /// Time column used for segment bounds.
    pub time_column: String,
    /// Entity code column, if the dataset has one.
    pub code_column: Option<String>,
    /// Per string column, the larger of the declared minimum width and the
    /// widest value ever written.
    pub string_widths: BTreeMap<String, usize>,
    /// When the table was first created.
    pub created_at: DateTime<Utc>,
    /// On-disk format version.
    pub format_version: u32,
}

impl TableMeta {
    /// Current on-disk format version.
    pub const FORMAT_VERSION: u32 = 1;

    /// Fresh metadata for a dataset, seeded with its width hints.
    pub fn for_dataset(dataset: &DatasetDescriptor, created_at: DateTime<Utc>) -> Self {
        Self {
            dataset: dataset.name.clone(),
            columns: dataset.columns.clone(),
            time_column: dataset.date_column.clone(),
            code_column: dataset.code_column.clone(),
            string_widths: dataset.min_widths.clone(),
            created_at,
            format_version: Self::FORMAT_VERSION,
        }
    }
}

/// An action recorded in a commit.
///
/// Actions are applied in order when the table state is rebuilt.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum LogAction {
    /// Add or replace a segment.
    AddSegment(SegmentMeta),

    /// Remove a segment by its logical ID.
    RemoveSegment {
        /// Logical identifier of the segment to remove.
        segment_id: SegmentId,
    },

    /// Replace table-level metadata wholesale.
    UpdateTableMeta(TableMeta),

    /// Set a dataset-wide scalar attribute.
    SetAttribute {
        /// Attribute name.
        name: String,
        /// JSON value.
        value: serde_json::Value,
    },
}

/// A single, immutable commit in the log.
///
/// The version field must match the file name; `base_version` records what
/// the writer believed was the current version when the commit was prepared.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Commit {
    /// The version number of this commit (monotonic, starting from 1).
    pub version: u64,

    /// The version the writer started from.
    pub base_version: u64,

    /// Commit creation timestamp, stored as RFC3339 UTC.
    pub timestamp: DateTime<Utc>,

    /// Ordered list of actions applied by this commit.
    pub actions: Vec<LogAction>,
}
