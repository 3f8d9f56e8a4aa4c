//! Segment metadata.
//!
//! A segment is one immutable Parquet file of rows. Its log entry records
//! the time span it covers and, once the level has been indexed, the sorted
//! list of entity codes it contains, which lets code-filtered reads skip it.
use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Logical identifier of a segment.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(pub String);

impl SegmentId {
    /// Identifier for the `ordinal`-th segment written by commit `version`.
    ///
    /// The random suffix keeps a retried commit from colliding with files
    /// orphaned by an earlier failed attempt at the same version.
    pub fn for_commit(version: u64, ordinal: usize) -> Self {
        let salt: u32 = rand::random();
        SegmentId(format!("seg-{version:010}-{ordinal:04}-{salt:08x}"))
    }

    /// Relative path of the segment's data file.
    pub fn data_path(&self) -> String {
        format!("data/{}.parquet", self.0)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata for one live segment.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentMeta {
    /// Logical identifier.
    pub segment_id: SegmentId,
    /// Path relative to the level directory.
    pub path: String,
    /// Earliest time key in the segment.
    pub ts_min: NaiveDateTime,
    /// Latest time key in the segment.
    pub ts_max: NaiveDateTime,
    /// Number of rows.
    pub row_count: u64,
    /// Sorted entity codes present, recorded by index builds; `None` for
    /// segments appended since the last index build.
    #[serde(default)]
    pub entities: Option<Vec<String>>,
}

impl SegmentMeta {
    /// Whether the segment may contain any of `codes`. Unindexed segments
    /// always may.
    pub fn may_contain_any<'a>(&self, mut codes: impl Iterator<Item = &'a String>) -> bool {
        match &self.entities {
            None => true,
            Some(entities) => codes.any(|c| entities.binary_search(c).is_ok()),
        }
    }
}
