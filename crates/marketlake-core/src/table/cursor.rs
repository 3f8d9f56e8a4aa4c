//! Restartable forward-only row cursor.

use std::collections::VecDeque;

use crate::{
    dataset::ColumnSpec,
    predicate::Predicate,
    row::Row,
    storage::TableLocation,
    table::{error::TableError, segment_io::read_segment},
    transaction_log::SegmentMeta,
};

/// Default number of rows handed out per [`RowCursor::next_batch`] call.
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Streams matching rows segment by segment.
///
/// The cursor works over the set of segments live when it was created. A
/// later mutating commit may delete those segment files, so a cursor should
/// be drained before the level is written again.
#[derive(Debug)]
pub struct RowCursor {
    location: TableLocation,
    columns: Vec<ColumnSpec>,
    segments: Vec<SegmentMeta>,
    predicate: Option<Predicate>,
    batch_size: usize,
    next_segment: usize,
    buffer: VecDeque<Row>,
}

impl RowCursor {
    pub(crate) fn new(
        location: TableLocation,
        columns: Vec<ColumnSpec>,
        segments: Vec<SegmentMeta>,
        predicate: Option<Predicate>,
        batch_size: usize,
    ) -> Self {
        Self {
            location,
            columns,
            segments,
            predicate,
            batch_size: batch_size.max(1),
            next_segment: 0,
            buffer: VecDeque::new(),
        }
    }

    /// A cursor over nothing, used for levels that were never written.
    pub(crate) fn empty() -> Self {
        Self::new(TableLocation::local(""), Vec::new(), Vec::new(), None, 1)
    }

    /// Next batch of at most `batch_size` rows, or `None` once exhausted.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Row>>, TableError> {
        while self.buffer.len() < self.batch_size && self.next_segment < self.segments.len() {
            let segment = &self.segments[self.next_segment];
            self.next_segment += 1;

            let rows = read_segment(&self.location, segment, &self.columns).await?;
            match &self.predicate {
                Some(p) => self.buffer.extend(rows.into_iter().filter(|r| p.matches(r))),
                None => self.buffer.extend(rows),
            }
        }

        if self.buffer.is_empty() {
            return Ok(None);
        }
        let take = self.batch_size.min(self.buffer.len());
        Ok(Some(self.buffer.drain(..take).collect()))
    }

    /// Rewind to the first row.
    pub fn restart(&mut self) {
        self.next_segment = 0;
        self.buffer.clear();
    }

    /// Number of segments the cursor will visit.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
}
