//! Time-indexed row tables, one per dataset level.
//!
//! A [`TableStore`] is rooted at a store directory and serves every level
//! registered in its [`DatasetRegistry`]. Each level's rows live in immutable
//! Parquet segments tracked by the level's commit log; every mutation
//! (append, remove, replace, overwrite, index rebuild, attribute update)
//! lands as exactly one commit, so readers see either the previous or the
//! next table state.
//!
//! Reads prune segments by their recorded time span and, once
//! [`TableStore::create_index`] has run, by the entity codes each segment
//! holds. Appends never rebuild that index; segments written afterwards
//! simply carry no entity list and are always scanned.

pub mod cursor;
pub mod error;
pub(crate) mod segment_io;

pub use cursor::{DEFAULT_BATCH_SIZE, RowCursor};
pub use error::TableError;

use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet, HashSet},
    path::Path,
    sync::Arc,
};

use chrono::{NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tracing::{debug, info};

use crate::{
    dataset::{ColumnType, DatasetDescriptor, DatasetRegistry},
    predicate::{Predicate, codes_clause, time_clause},
    row::Row,
    storage::{self, TableLocation},
    table::error::{
        DatasetSnafu, InvalidPredicateSnafu, MissingTableSnafu, SchemaMismatchSnafu,
        TransactionLogSnafu,
    },
    transaction_log::{
        LogAction, SegmentId, SegmentMeta, TableMeta, TableState, TransactionLogStore,
    },
};

/// How a free-form filter combines with the time clause of a query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connector {
    /// `time & filter`.
    #[default]
    And,
    /// `time | filter`.
    Or,
}

/// Parameters of a [`TableStore::query`] call.
#[derive(Clone, Debug, Default)]
pub struct QueryOptions {
    /// Restrict to these entity codes; empty means all.
    pub codes: Vec<String>,
    /// First day, inclusive.
    pub start: Option<NaiveDate>,
    /// Last day, inclusive.
    pub end: Option<NaiveDate>,
    /// Extra predicate.
    pub filter: Option<Predicate>,
    /// How `filter` combines with the time clause.
    pub connector: Connector,
    /// Rows per cursor batch; defaults to [`DEFAULT_BATCH_SIZE`].
    pub batch_size: Option<usize>,
}

impl QueryOptions {
    /// Restrict to `codes`.
    pub fn codes<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.codes = codes.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict to `[start, end]`.
    pub fn between(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    /// Add a filter joined with `connector`.
    pub fn filter(mut self, filter: Predicate, connector: Connector) -> Self {
        self.filter = Some(filter);
        self.connector = connector;
        self
    }

    /// Cursor batch size.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }
}

/// Build the predicate a query evaluates.
///
/// The time clause and the filter combine with the requested connector; the
/// code membership clause, if any, is always ANDed on top. Codes must match
/// the dataset's code pattern.
pub fn compose_query_predicate(
    dataset: &DatasetDescriptor,
    options: &QueryOptions,
) -> Result<Option<Predicate>, TableError> {
    let time = time_clause(&dataset.date_column, options.start, options.end);
    let mut predicate = match (time, options.filter.clone()) {
        (Some(t), Some(f)) => Some(match options.connector {
            Connector::And => t.and(f),
            Connector::Or => t.or(f),
        }),
        (t, f) => t.or(f),
    };

    if !options.codes.is_empty() {
        let code_column = dataset.code_column.as_deref().context(SchemaMismatchSnafu {
            level: dataset.name.as_str(),
            column: "code",
            reason: "dataset has no code column",
        })?;
        let pattern = dataset.code_regex().context(DatasetSnafu)?;
        let clause =
            codes_clause(code_column, &options.codes, &pattern).context(InvalidPredicateSnafu)?;
        predicate = match (predicate, clause) {
            (Some(p), Some(c)) => Some(p.and(c)),
            (p, c) => p.or(c),
        };
    }

    if let Some(p) = &predicate {
        check_predicate_columns(dataset, p)?;
    }
    Ok(predicate)
}

/// Outcome of an append.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AppendReport {
    /// Rows written.
    pub appended: u64,
    /// Rows dropped because their unique key was already present.
    pub duplicates_dropped: u64,
}

/// Outcome of a delete-then-insert.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReplaceReport {
    /// Rows deleted by the predicate.
    pub removed: u64,
    /// Rows written.
    pub appended: u64,
    /// Rows dropped because their unique key was already present.
    pub duplicates_dropped: u64,
}

/// Outcome of an index build.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    /// False when the level was already indexed and nothing was written.
    pub rebuilt: bool,
    /// Live segments before the build.
    pub segments_before: usize,
    /// Rows in the level.
    pub rows: u64,
    /// Distinct entity codes in the level.
    pub entities: usize,
}

/// Summary of one level, as shown by `describe`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TableDescription {
    /// Level name.
    pub level: String,
    /// Current log version.
    pub version: u64,
    /// Total rows.
    pub rows: u64,
    /// Live segment count.
    pub segments: usize,
    /// Whether every segment carries an entity list.
    pub indexed: bool,
    /// Earliest time key.
    pub ts_min: Option<NaiveDateTime>,
    /// Latest time key.
    pub ts_max: Option<NaiveDateTime>,
    /// Recorded string widths.
    pub string_widths: BTreeMap<String, usize>,
    /// Table attributes.
    pub attributes: BTreeMap<String, serde_json::Value>,
}

/// Store of row tables rooted at one directory.
#[derive(Clone, Debug)]
pub struct TableStore {
    root: TableLocation,
    registry: Arc<DatasetRegistry>,
}

#[derive(Default)]
struct Change<'a> {
    predicate: Option<&'a Predicate>,
    rows: Vec<Row>,
    replace_all: bool,
    dedup: bool,
    entities: Option<Vec<String>>,
    attributes: Vec<(String, serde_json::Value)>,
}

#[derive(Debug, Default)]
struct ChangeOutcome {
    removed: u64,
    appended: u64,
    duplicates_dropped: u64,
}

impl TableStore {
    /// Store rooted at `root` serving the levels in `registry`.
    pub fn open(root: TableLocation, registry: Arc<DatasetRegistry>) -> Self {
        Self { root, registry }
    }

    /// Store root.
    pub fn root(&self) -> &TableLocation {
        &self.root
    }

    /// Registered levels.
    pub fn registry(&self) -> &DatasetRegistry {
        &self.registry
    }

    /// Descriptor of a registered level.
    pub fn dataset(&self, level: &str) -> Result<&DatasetDescriptor, TableError> {
        self.registry.get(level).context(DatasetSnafu)
    }

    /// Directory holding a level.
    pub fn level_location(&self, level: &str) -> TableLocation {
        self.root.child(level)
    }

    fn log(&self, level: &str) -> TransactionLogStore {
        TransactionLogStore::new(self.level_location(level))
    }

    async fn load_state(&self, level: &str) -> Result<Option<TableState>, TableError> {
        let log = self.log(level);
        let version = log.load_current_version().await.context(TransactionLogSnafu)?;
        if version == 0 {
            return Ok(None);
        }
        log.rebuild_table_state()
            .await
            .map(Some)
            .context(TransactionLogSnafu)
    }

    async fn require_state(&self, level: &str) -> Result<TableState, TableError> {
        self.load_state(level)
            .await?
            .context(MissingTableSnafu { level })
    }

    /// Whether the level has ever been written.
    pub async fn exists(&self, level: &str) -> Result<bool, TableError> {
        self.dataset(level)?;
        let version = self
            .log(level)
            .load_current_version()
            .await
            .context(TransactionLogSnafu)?;
        Ok(version > 0)
    }

    /// Append rows.
    ///
    /// Empty input is a no-op. Every row must carry the level's key columns
    /// and only declared columns. On `unique` levels rows whose
    /// `(date, code)` is already stored, or appears earlier in the batch,
    /// are dropped and counted.
    pub async fn append(&self, level: &str, rows: Vec<Row>) -> Result<AppendReport, TableError> {
        if rows.is_empty() {
            return Ok(AppendReport::default());
        }
        let dataset = self.dataset(level)?;
        check_rows(dataset, &rows)?;

        let state = self.load_state(level).await?;
        let outcome = self
            .apply_change(
                dataset,
                state,
                Change {
                    rows,
                    dedup: dataset.unique,
                    ..Change::default()
                },
            )
            .await?;

        debug!(
            level,
            appended = outcome.appended,
            duplicates = outcome.duplicates_dropped,
            "appended rows"
        );
        Ok(AppendReport {
            appended: outcome.appended,
            duplicates_dropped: outcome.duplicates_dropped,
        })
    }

    /// Delete rows matching `predicate` and return how many were removed.
    ///
    /// Fails with [`TableError::MissingTable`] when the level was never
    /// written; callers treat that as zero rows.
    pub async fn remove(&self, level: &str, predicate: &Predicate) -> Result<u64, TableError> {
        let dataset = self.dataset(level)?;
        check_predicate_columns(dataset, predicate)?;
        let state = self.require_state(level).await?;

        let outcome = self
            .apply_change(
                dataset,
                Some(state),
                Change {
                    predicate: Some(predicate),
                    ..Change::default()
                },
            )
            .await?;

        debug!(level, removed = outcome.removed, %predicate, "removed rows");
        Ok(outcome.removed)
    }

    /// Delete rows matching `predicate` and append `rows` in one commit.
    ///
    /// Creates the level if it does not exist yet.
    pub async fn replace(
        &self,
        level: &str,
        predicate: &Predicate,
        rows: Vec<Row>,
    ) -> Result<ReplaceReport, TableError> {
        let dataset = self.dataset(level)?;
        check_predicate_columns(dataset, predicate)?;
        check_rows(dataset, &rows)?;

        let state = self.load_state(level).await?;
        let outcome = self
            .apply_change(
                dataset,
                state,
                Change {
                    predicate: Some(predicate),
                    rows,
                    dedup: dataset.unique,
                    ..Change::default()
                },
            )
            .await?;

        info!(
            level,
            removed = outcome.removed,
            appended = outcome.appended,
            duplicates = outcome.duplicates_dropped,
            "replaced rows"
        );
        Ok(ReplaceReport {
            removed: outcome.removed,
            appended: outcome.appended,
            duplicates_dropped: outcome.duplicates_dropped,
        })
    }

    /// Overwrite the whole level with `rows` in one commit.
    pub async fn put(&self, level: &str, rows: Vec<Row>) -> Result<AppendReport, TableError> {
        let dataset = self.dataset(level)?;
        check_rows(dataset, &rows)?;

        let state = self.load_state(level).await?;
        let outcome = self
            .apply_change(
                dataset,
                state,
                Change {
                    rows,
                    replace_all: true,
                    dedup: dataset.unique,
                    ..Change::default()
                },
            )
            .await?;

        info!(level, rows = outcome.appended, "overwrote table");
        Ok(AppendReport {
            appended: outcome.appended,
            duplicates_dropped: outcome.duplicates_dropped,
        })
    }

    /// Materialize every matching row.
    pub async fn query(&self, level: &str, options: &QueryOptions) -> Result<Vec<Row>, TableError> {
        let mut cursor = self.query_stream(level, options).await?;
        let mut rows = Vec::new();
        while let Some(batch) = cursor.next_batch().await? {
            rows.extend(batch);
        }
        Ok(rows)
    }

    /// Cursor over matching rows.
    pub async fn query_stream(
        &self,
        level: &str,
        options: &QueryOptions,
    ) -> Result<RowCursor, TableError> {
        let dataset = self.dataset(level)?;
        let predicate = compose_query_predicate(dataset, options)?;
        let state = self.require_state(level).await?;

        let segments: Vec<SegmentMeta> = state
            .segments_in_order()
            .into_iter()
            .filter(|seg| predicate.as_ref().is_none_or(|p| may_match(dataset, seg, p)))
            .collect();

        debug!(
            level,
            segments = segments.len(),
            live = state.segments.len(),
            "planned query"
        );
        Ok(RowCursor::new(
            self.level_location(level),
            dataset.columns.clone(),
            segments,
            predicate,
            options.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
        ))
    }

    /// Cursor over every row of the level; an empty cursor when the level
    /// was never written.
    pub async fn scan_all(&self, level: &str, batch_size: usize) -> Result<RowCursor, TableError> {
        match self
            .query_stream(level, &QueryOptions::default().batch_size(batch_size))
            .await
        {
            Err(e) if e.is_missing_table() => Ok(RowCursor::empty()),
            other => other,
        }
    }

    /// Total rows; zero for a level never written.
    pub async fn row_count(&self, level: &str) -> Result<u64, TableError> {
        self.dataset(level)?;
        Ok(self
            .load_state(level)
            .await?
            .map_or(0, |state| state.row_count()))
    }

    /// Rebuild the entity index.
    ///
    /// Compacts every live segment into one segment sorted by the key
    /// columns and records its entity codes. A level that is already
    /// indexed is left untouched.
    pub async fn create_index(&self, level: &str) -> Result<IndexReport, TableError> {
        let dataset = self.dataset(level)?;
        let state = self.require_state(level).await?;
        let segments_before = state.segments.len();

        if state.is_indexed() && segments_before <= 1 {
            let entities = state
                .segments
                .values()
                .filter_map(|s| s.entities.as_ref())
                .map(Vec::len)
                .sum();
            return Ok(IndexReport {
                rebuilt: false,
                segments_before,
                rows: state.row_count(),
                entities,
            });
        }

        let mut rows = self.read_all(dataset, &state).await?;
        let keys = dataset.key_columns();
        rows.sort_by(|a, b| cmp_rows(a, b, &keys));

        let entities: Vec<String> = match &dataset.code_column {
            Some(code) => rows
                .iter()
                .filter_map(|r| r.value(code).as_str())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .map(str::to_string)
                .collect(),
            None => Vec::new(),
        };
        let report = IndexReport {
            rebuilt: true,
            segments_before,
            rows: rows.len() as u64,
            entities: entities.len(),
        };

        self.apply_change(
            dataset,
            Some(state),
            Change {
                rows,
                replace_all: true,
                entities: Some(entities),
                ..Change::default()
            },
        )
        .await?;

        info!(
            level,
            segments_before,
            rows = report.rows,
            entities = report.entities,
            "rebuilt index"
        );
        Ok(report)
    }

    /// Remove duplicate key tuples, keeping the first occurrence, and return
    /// how many rows were dropped.
    ///
    /// `key_columns` defaults to the level's key columns.
    pub async fn drop_duplicates(
        &self,
        level: &str,
        key_columns: Option<&[String]>,
    ) -> Result<u64, TableError> {
        let dataset = self.dataset(level)?;
        let keys: Vec<&str> = match key_columns {
            Some(cols) => cols.iter().map(String::as_str).collect(),
            None => dataset.key_columns(),
        };
        for key in &keys {
            ensure!(
                dataset.column(key).is_some(),
                SchemaMismatchSnafu {
                    level,
                    column: *key,
                    reason: "not a declared column",
                }
            );
        }

        let state = self.require_state(level).await?;
        let rows = self.read_all(dataset, &state).await?;
        let total = rows.len();

        let mut seen = HashSet::with_capacity(total);
        let kept: Vec<Row> = rows
            .into_iter()
            .filter(|r| seen.insert(r.key_of(&keys)))
            .collect();
        let dropped = (total - kept.len()) as u64;

        if dropped > 0 {
            self.apply_change(
                dataset,
                Some(state),
                Change {
                    rows: kept,
                    replace_all: true,
                    ..Change::default()
                },
            )
            .await?;
        }

        info!(level, dropped, "dropped duplicate rows");
        Ok(dropped)
    }

    /// Read a table attribute; `None` when unset or the level was never
    /// written.
    pub async fn get_attr(
        &self,
        level: &str,
        name: &str,
    ) -> Result<Option<serde_json::Value>, TableError> {
        self.dataset(level)?;
        Ok(self
            .load_state(level)
            .await?
            .and_then(|mut state| state.attributes.remove(name)))
    }

    /// Set a table attribute, creating the level if needed.
    pub async fn set_attr(
        &self,
        level: &str,
        name: &str,
        value: serde_json::Value,
    ) -> Result<(), TableError> {
        let dataset = self.dataset(level)?;
        let state = self.load_state(level).await?;
        self.apply_change(
            dataset,
            state,
            Change {
                attributes: vec![(name.to_string(), value)],
                ..Change::default()
            },
        )
        .await?;
        Ok(())
    }

    /// Summarize a level.
    pub async fn describe(&self, level: &str) -> Result<TableDescription, TableError> {
        self.dataset(level)?;
        let state = self.require_state(level).await?;
        let segments = state.segments_in_order();

        Ok(TableDescription {
            level: level.to_string(),
            version: state.version,
            rows: state.row_count(),
            segments: segments.len(),
            indexed: state.is_indexed(),
            ts_min: segments.iter().map(|s| s.ts_min).min(),
            ts_max: segments.iter().map(|s| s.ts_max).max(),
            string_widths: state.table_meta.string_widths.clone(),
            attributes: state.attributes.clone(),
        })
    }

    async fn read_all(
        &self,
        dataset: &DatasetDescriptor,
        state: &TableState,
    ) -> Result<Vec<Row>, TableError> {
        let location = self.level_location(&dataset.name);
        let mut rows = Vec::with_capacity(state.row_count() as usize);
        for segment in state.segments_in_order() {
            rows.extend(segment_io::read_segment(&location, &segment, &dataset.columns).await?);
        }
        Ok(rows)
    }

    /// Apply one change as a single commit.
    ///
    /// Segments holding rows matched by the predicate are rewritten: their
    /// surviving rows are carried into the new segment together with the
    /// incoming rows. With `dedup`, incoming rows are checked against the
    /// keys of every stored row that survives the change.
    async fn apply_change(
        &self,
        dataset: &DatasetDescriptor,
        state: Option<TableState>,
        change: Change<'_>,
    ) -> Result<ChangeOutcome, TableError> {
        let location = self.level_location(&dataset.name);
        let expected = state.as_ref().map_or(0, |s| s.version);
        let segments = state
            .as_ref()
            .map(TableState::segments_in_order)
            .unwrap_or_default();
        let unique_columns = dataset.unique_columns();
        let check_existing = change.dedup && !change.rows.is_empty();

        let mut outcome = ChangeOutcome::default();
        let mut removed_segments: Vec<SegmentMeta> = Vec::new();
        let mut carried: Vec<Row> = Vec::new();
        let mut known_keys: HashSet<String> = HashSet::new();

        if change.replace_all {
            outcome.removed = segments.iter().map(|s| s.row_count).sum();
            removed_segments = segments;
        } else {
            let span = time_span(&change.rows, &dataset.date_column);
            let codes: Option<BTreeSet<String>> = dataset.code_column.as_ref().map(|c| {
                change
                    .rows
                    .iter()
                    .filter_map(|r| r.value(c).as_str().map(str::to_string))
                    .collect()
            });

            for segment in segments {
                let touched = change
                    .predicate
                    .is_some_and(|p| may_match(dataset, &segment, p));
                let overlaps_incoming = check_existing
                    && span.is_some_and(|(lo, hi)| segment.ts_max >= lo && segment.ts_min <= hi)
                    && codes
                        .as_ref()
                        .is_none_or(|codes| segment.may_contain_any(codes.iter()));
                if !touched && !overlaps_incoming {
                    continue;
                }

                let rows = segment_io::read_segment(&location, &segment, &dataset.columns).await?;
                let (gone, kept): (Vec<Row>, Vec<Row>) = match change.predicate {
                    Some(p) if touched => rows.into_iter().partition(|r| p.matches(r)),
                    _ => (Vec::new(), rows),
                };
                if check_existing {
                    known_keys.extend(kept.iter().map(|r| r.key_of(&unique_columns)));
                }
                if !gone.is_empty() {
                    outcome.removed += gone.len() as u64;
                    removed_segments.push(segment);
                    carried.extend(kept);
                }
            }
        }

        let accepted: Vec<Row> = if change.dedup {
            let mut accepted = Vec::with_capacity(change.rows.len());
            for row in change.rows {
                if known_keys.insert(row.key_of(&unique_columns)) {
                    accepted.push(row);
                } else {
                    outcome.duplicates_dropped += 1;
                }
            }
            accepted
        } else {
            change.rows
        };
        outcome.appended = accepted.len() as u64;

        let (mut meta, mut meta_changed) = match &state {
            Some(s) => (s.table_meta.clone(), false),
            None => (TableMeta::for_dataset(dataset, Utc::now()), true),
        };
        meta_changed |= widen_string_widths(&mut meta, dataset, &accepted);

        let mut new_rows = carried;
        new_rows.extend(accepted);

        if removed_segments.is_empty()
            && new_rows.is_empty()
            && !meta_changed
            && change.attributes.is_empty()
        {
            return Ok(outcome);
        }

        let version = expected + 1;
        let mut actions = Vec::new();
        if meta_changed {
            actions.push(LogAction::UpdateTableMeta(meta));
        }
        actions.extend(removed_segments.iter().map(|s| LogAction::RemoveSegment {
            segment_id: s.segment_id.clone(),
        }));
        if !new_rows.is_empty() {
            let segment = segment_io::write_segment(
                &location,
                SegmentId::for_commit(version, 0),
                &dataset.columns,
                &dataset.date_column,
                &new_rows,
                change.entities,
            )
            .await?;
            actions.push(LogAction::AddSegment(segment));
        }
        actions.extend(
            change
                .attributes
                .into_iter()
                .map(|(name, value)| LogAction::SetAttribute { name, value }),
        );

        self.log(&dataset.name)
            .commit_with_expected_version(expected, actions)
            .await
            .context(TransactionLogSnafu)?;

        for segment in &removed_segments {
            if let Err(e) = storage::remove_file(&location, Path::new(&segment.path)).await {
                debug!(segment = %segment.segment_id, error = %e, "left unreferenced segment file");
            }
        }

        Ok(outcome)
    }
}

fn check_rows(dataset: &DatasetDescriptor, rows: &[Row]) -> Result<(), TableError> {
    let keys = dataset.key_columns();
    for row in rows {
        for key in &keys {
            ensure!(
                !row.value(key).is_null(),
                SchemaMismatchSnafu {
                    level: dataset.name.as_str(),
                    column: *key,
                    reason: "key column is missing",
                }
            );
        }
        for (column, value) in row.iter() {
            let spec = dataset.column(column).context(SchemaMismatchSnafu {
                level: dataset.name.as_str(),
                column,
                reason: "column is not declared",
            })?;
            ensure!(
                value.conforms_to(spec.column_type),
                SchemaMismatchSnafu {
                    level: dataset.name.as_str(),
                    column,
                    reason: format!("value {value} is not a {:?}", spec.column_type),
                }
            );
        }
    }
    Ok(())
}

fn check_predicate_columns(
    dataset: &DatasetDescriptor,
    predicate: &Predicate,
) -> Result<(), TableError> {
    for column in predicate.columns() {
        ensure!(
            dataset.column(column).is_some(),
            SchemaMismatchSnafu {
                level: dataset.name.as_str(),
                column,
                reason: "predicate names an undeclared column",
            }
        );
    }
    Ok(())
}

/// Whether a segment can hold rows matching `predicate`.
fn may_match(dataset: &DatasetDescriptor, segment: &SegmentMeta, predicate: &Predicate) -> bool {
    if !predicate
        .time_bounds(&dataset.date_column)
        .overlaps(segment.ts_min, segment.ts_max)
    {
        return false;
    }
    match dataset
        .code_column
        .as_deref()
        .and_then(|c| predicate.code_set(c))
    {
        Some(codes) => segment.may_contain_any(codes.iter()),
        None => true,
    }
}

fn time_span(rows: &[Row], column: &str) -> Option<(NaiveDateTime, NaiveDateTime)> {
    rows.iter()
        .filter_map(|r| r.time_key(column))
        .fold(None, |acc, t| match acc {
            None => Some((t, t)),
            Some((lo, hi)) => Some((lo.min(t), hi.max(t))),
        })
}

fn cmp_rows(a: &Row, b: &Row, keys: &[&str]) -> Ordering {
    keys.iter()
        .map(|k| a.value(k).compare(b.value(k)).unwrap_or(Ordering::Equal))
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// Raise recorded string widths to the widest value in `rows`.
fn widen_string_widths(meta: &mut TableMeta, dataset: &DatasetDescriptor, rows: &[Row]) -> bool {
    let mut changed = false;
    for spec in dataset
        .columns
        .iter()
        .filter(|c| c.column_type == ColumnType::Utf8)
    {
        let widest = rows
            .iter()
            .filter_map(|r| r.value(&spec.name).as_str())
            .map(|s| s.chars().count())
            .max()
            .unwrap_or(0);
        let current = meta.string_widths.get(&spec.name).copied().unwrap_or(0);
        if widest > current {
            meta.string_widths.insert(spec.name.clone(), widest);
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_util::{daily_quotes, date};
    use crate::predicate::CompareOp;
    use crate::row::Value;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const LEVEL: &str = "daily_quote";

    fn store_with(tmp: &TempDir, datasets: Vec<DatasetDescriptor>) -> TableStore {
        let registry = DatasetRegistry::from_descriptors(datasets).expect("valid registry");
        TableStore::open(TableLocation::local(tmp.path()), Arc::new(registry))
    }

    fn quote_store(tmp: &TempDir) -> TableStore {
        store_with(tmp, vec![daily_quotes()])
    }

    fn quote(day: NaiveDate, code: &str, close: f64) -> Row {
        Row::new()
            .with("date", day)
            .with("code", code)
            .with("close", close)
    }

    fn days(rows: &[Row]) -> Vec<NaiveDate> {
        rows.iter()
            .filter_map(|r| match r.value("date") {
                Value::Date(d) => Some(*d),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn append_empty_is_a_no_op() -> TestResult {
        let tmp = TempDir::new()?;
        let store = quote_store(&tmp);

        let report = store.append(LEVEL, Vec::new()).await?;
        assert_eq!(report, AppendReport::default());
        assert_eq!(store.row_count(LEVEL).await?, 0);
        assert!(!store.exists(LEVEL).await?);

        store.append(LEVEL, vec![quote(date(2020, 1, 2), "000001", 1.0)]).await?;
        store.append(LEVEL, Vec::new()).await?;
        assert_eq!(store.row_count(LEVEL).await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn append_rejects_rows_without_key_columns() -> TestResult {
        let tmp = TempDir::new()?;
        let store = quote_store(&tmp);

        let err = store
            .append(LEVEL, vec![Row::new().with("date", date(2020, 1, 2))])
            .await
            .expect_err("missing code");
        assert!(matches!(err, TableError::SchemaMismatch { ref column, .. } if column == "code"));

        let err = store
            .append(
                LEVEL,
                vec![quote(date(2020, 1, 2), "000001", 1.0).with("bogus", 1_i64)],
            )
            .await
            .expect_err("undeclared column");
        assert!(matches!(err, TableError::SchemaMismatch { .. }));
        assert!(!store.exists(LEVEL).await?);
        Ok(())
    }

    #[tokio::test]
    async fn unique_levels_drop_duplicate_keys() -> TestResult {
        let tmp = TempDir::new()?;
        let store = quote_store(&tmp);

        let first = store
            .append(
                LEVEL,
                vec![
                    quote(date(2020, 1, 2), "000001", 1.0),
                    quote(date(2020, 1, 2), "000001", 9.0),
                    quote(date(2020, 1, 2), "000002", 2.0),
                ],
            )
            .await?;
        assert_eq!(first.appended, 2);
        assert_eq!(first.duplicates_dropped, 1);

        let second = store
            .append(
                LEVEL,
                vec![
                    quote(date(2020, 1, 2), "000002", 3.0),
                    quote(date(2020, 1, 3), "000002", 4.0),
                ],
            )
            .await?;
        assert_eq!(second.appended, 1);
        assert_eq!(second.duplicates_dropped, 1);

        let rows = store.query(LEVEL, &QueryOptions::default()).await?;
        let keys: HashSet<String> = rows.iter().map(|r| r.key_of(&["date", "code"])).collect();
        assert_eq!(keys.len(), rows.len());
        assert_eq!(rows.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn query_filters_by_codes_and_dates() -> TestResult {
        let tmp = TempDir::new()?;
        let store = quote_store(&tmp);
        store
            .append(
                LEVEL,
                (1..=9)
                    .flat_map(|d| {
                        [
                            quote(date(2020, 1, d), "000001", f64::from(d)),
                            quote(date(2020, 1, d), "000002", f64::from(d)),
                        ]
                    })
                    .collect(),
            )
            .await?;

        let rows = store
            .query(
                LEVEL,
                &QueryOptions::default()
                    .codes(["000002"])
                    .between(Some(date(2020, 1, 3)), Some(date(2020, 1, 5))),
            )
            .await?;
        assert_eq!(days(&rows), vec![date(2020, 1, 3), date(2020, 1, 4), date(2020, 1, 5)]);
        assert!(rows.iter().all(|r| r.value("code").as_str() == Some("000002")));

        let same_day = store
            .query(
                LEVEL,
                &QueryOptions::default().between(Some(date(2020, 1, 4)), Some(date(2020, 1, 4))),
            )
            .await?;
        assert_eq!(same_day.len(), 2);

        let filtered = store
            .query(
                LEVEL,
                &QueryOptions::default()
                    .between(Some(date(2020, 1, 8)), None)
                    .filter(Predicate::parse("close < 2")?, Connector::Or)
                    .codes(["000001"]),
            )
            .await?;
        assert_eq!(
            days(&filtered),
            vec![date(2020, 1, 1), date(2020, 1, 8), date(2020, 1, 9)]
        );
        Ok(())
    }

    #[tokio::test]
    async fn query_rejects_malformed_codes_and_unknown_columns() -> TestResult {
        let tmp = TempDir::new()?;
        let store = quote_store(&tmp);
        store.append(LEVEL, vec![quote(date(2020, 1, 2), "000001", 1.0)]).await?;

        let err = store
            .query(LEVEL, &QueryOptions::default().codes(["ABC"]))
            .await
            .expect_err("invalid code");
        assert!(matches!(err, TableError::InvalidPredicate { .. }));

        let err = store
            .query(
                LEVEL,
                &QueryOptions::default().filter(Predicate::parse("nope > 1")?, Connector::And),
            )
            .await
            .expect_err("unknown column");
        assert!(matches!(err, TableError::SchemaMismatch { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn remove_and_query_on_missing_table_signal_missing_table() -> TestResult {
        let tmp = TempDir::new()?;
        let store = quote_store(&tmp);
        let predicate = Predicate::compare("date", CompareOp::Ge, date(2020, 1, 1));

        let err = store.remove(LEVEL, &predicate).await.expect_err("missing");
        assert!(err.is_missing_table());
        let err = store
            .query(LEVEL, &QueryOptions::default())
            .await
            .expect_err("missing");
        assert!(err.is_missing_table());

        let mut cursor = store.scan_all(LEVEL, 10).await?;
        assert!(cursor.next_batch().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn remove_deletes_only_matching_rows() -> TestResult {
        let tmp = TempDir::new()?;
        let store = quote_store(&tmp);
        store
            .append(
                LEVEL,
                (1..=5).map(|d| quote(date(2020, 1, d), "000001", 1.0)).collect(),
            )
            .await?;

        let predicate = Predicate::compare("date", CompareOp::Ge, date(2020, 1, 4));
        assert_eq!(store.remove(LEVEL, &predicate).await?, 2);
        assert_eq!(store.row_count(LEVEL).await?, 3);
        assert_eq!(store.remove(LEVEL, &predicate).await?, 0);

        let rows = store.query(LEVEL, &QueryOptions::default()).await?;
        assert_eq!(days(&rows), (1..=3).map(|d| date(2020, 1, d)).collect::<Vec<_>>());
        Ok(())
    }

    #[tokio::test]
    async fn replace_swaps_the_tail_in_one_commit() -> TestResult {
        let tmp = TempDir::new()?;
        let store = quote_store(&tmp);
        store
            .append(
                LEVEL,
                (1..=5).map(|d| quote(date(2020, 1, d), "000001", 1.0)).collect(),
            )
            .await?;
        let before = store.describe(LEVEL).await?.version;

        let predicate = Predicate::compare("date", CompareOp::Ge, date(2020, 1, 4));
        let report = store
            .replace(
                LEVEL,
                &predicate,
                (4..=6).map(|d| quote(date(2020, 1, d), "000001", 2.0)).collect(),
            )
            .await?;

        assert_eq!(report.removed, 2);
        assert_eq!(report.appended, 3);
        assert_eq!(report.duplicates_dropped, 0);
        assert_eq!(store.describe(LEVEL).await?.version, before + 1);
        assert_eq!(store.row_count(LEVEL).await?, 6);

        let tail = store
            .query(
                LEVEL,
                &QueryOptions::default().between(Some(date(2020, 1, 4)), None),
            )
            .await?;
        assert!(tail.iter().all(|r| r.value("close") == &Value::Float(2.0)));
        Ok(())
    }

    #[tokio::test]
    async fn put_overwrites_everything() -> TestResult {
        let tmp = TempDir::new()?;
        let store = quote_store(&tmp);
        store
            .append(LEVEL, vec![quote(date(2020, 1, 1), "000001", 1.0)])
            .await?;

        store
            .put(
                LEVEL,
                vec![
                    quote(date(2020, 2, 1), "000002", 1.0),
                    quote(date(2020, 2, 2), "000002", 1.0),
                ],
            )
            .await?;
        let rows = store.query(LEVEL, &QueryOptions::default()).await?;
        assert_eq!(days(&rows), vec![date(2020, 2, 1), date(2020, 2, 2)]);

        let report = store.put(LEVEL, Vec::new()).await?;
        assert_eq!(report.appended, 0);
        assert_eq!(store.row_count(LEVEL).await?, 0);
        assert!(store.exists(LEVEL).await?);
        Ok(())
    }

    #[tokio::test]
    async fn create_index_compacts_sorts_and_is_idempotent() -> TestResult {
        let tmp = TempDir::new()?;
        let store = quote_store(&tmp);
        store
            .append(LEVEL, vec![quote(date(2020, 1, 3), "000002", 1.0)])
            .await?;
        store
            .append(LEVEL, vec![quote(date(2020, 1, 1), "000001", 1.0)])
            .await?;
        assert!(!store.describe(LEVEL).await?.indexed);

        let report = store.create_index(LEVEL).await?;
        assert!(report.rebuilt);
        assert_eq!(report.segments_before, 2);
        assert_eq!(report.entities, 2);

        let description = store.describe(LEVEL).await?;
        assert!(description.indexed);
        assert_eq!(description.segments, 1);
        let version = description.version;

        let again = store.create_index(LEVEL).await?;
        assert!(!again.rebuilt);
        assert_eq!(store.describe(LEVEL).await?.version, version);

        let rows = store.query(LEVEL, &QueryOptions::default()).await?;
        assert_eq!(days(&rows), vec![date(2020, 1, 1), date(2020, 1, 3)]);

        // Code queries skip indexed segments that cannot hold the code.
        let cursor = store
            .query_stream(LEVEL, &QueryOptions::default().codes(["000009"]))
            .await?;
        assert_eq!(cursor.segment_count(), 0);

        store
            .append(LEVEL, vec![quote(date(2020, 1, 4), "000001", 1.0)])
            .await?;
        assert!(!store.describe(LEVEL).await?.indexed);
        Ok(())
    }

    #[tokio::test]
    async fn drop_duplicates_repairs_non_unique_levels() -> TestResult {
        let tmp = TempDir::new()?;
        let mut ds = daily_quotes();
        ds.unique = false;
        let store = store_with(&tmp, vec![ds]);

        store
            .append(
                LEVEL,
                vec![
                    quote(date(2020, 1, 1), "000001", 1.0),
                    quote(date(2020, 1, 1), "000001", 2.0),
                ],
            )
            .await?;
        store
            .append(LEVEL, vec![quote(date(2020, 1, 1), "000001", 3.0)])
            .await?;
        assert_eq!(store.row_count(LEVEL).await?, 3);

        assert_eq!(store.drop_duplicates(LEVEL, None).await?, 2);
        let rows = store.query(LEVEL, &QueryOptions::default()).await?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value("close"), &Value::Float(1.0));
        assert_eq!(store.drop_duplicates(LEVEL, None).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn attributes_bootstrap_the_table() -> TestResult {
        let tmp = TempDir::new()?;
        let store = quote_store(&tmp);

        assert_eq!(store.get_attr(LEVEL, "level_refresh_time").await?, None);
        store
            .set_attr(LEVEL, "level_refresh_time", serde_json::json!("2020-01-10T10:00:00"))
            .await?;
        assert_eq!(
            store.get_attr(LEVEL, "level_refresh_time").await?,
            Some(serde_json::json!("2020-01-10T10:00:00"))
        );
        assert_eq!(store.row_count(LEVEL).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn string_widths_keep_the_widest_value() -> TestResult {
        let tmp = TempDir::new()?;
        let store = quote_store(&tmp);
        store
            .append(
                LEVEL,
                vec![
                    quote(date(2020, 1, 1), "000001", 1.0)
                        .with("name", "A very long company name"),
                ],
            )
            .await?;

        let widths = store.describe(LEVEL).await?.string_widths;
        assert_eq!(widths.get("name"), Some(&24));
        assert_eq!(widths.get("code"), Some(&6));
        Ok(())
    }

    #[tokio::test]
    async fn cursor_batches_and_restarts() -> TestResult {
        let tmp = TempDir::new()?;
        let store = quote_store(&tmp);
        store
            .append(
                LEVEL,
                (1..=5).map(|d| quote(date(2020, 1, d), "000001", 1.0)).collect(),
            )
            .await?;

        let mut cursor = store
            .query_stream(LEVEL, &QueryOptions::default().batch_size(2))
            .await?;
        let mut sizes = Vec::new();
        while let Some(batch) = cursor.next_batch().await? {
            sizes.push(batch.len());
        }
        assert_eq!(sizes, vec![2, 2, 1]);

        cursor.restart();
        assert_eq!(cursor.next_batch().await?.map(|b| b.len()), Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_level_is_rejected() -> TestResult {
        let tmp = TempDir::new()?;
        let store = quote_store(&tmp);
        let err = store.row_count("nope").await.expect_err("unknown level");
        assert!(matches!(err, TableError::Dataset { .. }));
        Ok(())
    }
}
