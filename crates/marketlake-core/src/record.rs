//! Per-entity ledgers kept beside each level's rows.
//!
//! - [`RecordIndex`] (`record.json`): for each entity code, the earliest and
//!   latest time key stored. It is derived data, recomputed from a full scan
//!   by [`RecordIndex::rebuild`], and may be stale between runs.
//! - [`RefreshTimes`] (`refresh_time.json`): for each entity code, the last
//!   instant a per-entity fetch and append succeeded.
//!
//! Both files are rewritten with write-then-rename, so a crash leaves the
//! previous version in place.

use std::{collections::BTreeMap, path::Path};

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tracing::info;

use crate::{
    predicate::day_start,
    storage::{self, StorageError, TableLocation},
    table::{DEFAULT_BATCH_SIZE, TableError, TableStore},
};

/// Ledger key used for datasets without an entity code column.
pub const ALL_ENTITIES: &str = "*";

/// File holding the record index inside a level directory.
pub const RECORD_FILE_NAME: &str = "record.json";

/// File holding the refresh times inside a level directory.
pub const REFRESH_TIME_FILE_NAME: &str = "refresh_time.json";

/// Errors while loading, rebuilding or saving a ledger.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RecordError {
    /// Reading or writing the ledger file failed.
    #[snafu(display("Ledger storage error: {source}"))]
    Storage {
        /// Underlying storage error.
        source: StorageError,
    },

    /// Scanning the level's rows failed.
    #[snafu(display("Ledger rebuild failed: {source}"))]
    Table {
        /// Underlying table error.
        source: TableError,
    },

    /// The ledger file is not valid JSON of the expected shape.
    #[snafu(display("Ledger {file} is corrupt: {source}"))]
    Corrupt {
        /// File name.
        file: String,
        /// JSON error.
        source: serde_json::Error,
    },
}

/// Earliest and latest time key stored for one entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySpan {
    /// Earliest time key.
    pub min: NaiveDateTime,
    /// Latest time key.
    pub max: NaiveDateTime,
}

impl EntitySpan {
    fn widen(&mut self, at: NaiveDateTime) {
        self.min = self.min.min(at);
        self.max = self.max.max(at);
    }
}

async fn load_json<T>(location: &TableLocation, file: &str) -> Result<T, RecordError>
where
    T: Default + for<'de> Deserialize<'de>,
{
    match storage::read_to_string(location, Path::new(file)).await {
        Ok(json) => serde_json::from_str(&json).context(CorruptSnafu { file }),
        Err(e) if e.is_not_found() => Ok(T::default()),
        Err(source) => Err(RecordError::Storage { source }),
    }
}

async fn save_json<T: Serialize>(
    location: &TableLocation,
    file: &str,
    value: &T,
) -> Result<(), RecordError> {
    let json = serde_json::to_vec_pretty(value).context(CorruptSnafu { file })?;
    storage::write_atomic(location, Path::new(file), &json)
        .await
        .context(StorageSnafu)
}

/// Per-entity min/max time ledger of one level.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordIndex {
    location: TableLocation,
    entries: BTreeMap<String, EntitySpan>,
}

impl RecordIndex {
    /// Load the ledger from a level directory; a missing file is empty.
    pub async fn load(location: TableLocation) -> Result<Self, RecordError> {
        let entries = load_json(&location, RECORD_FILE_NAME).await?;
        Ok(Self { location, entries })
    }

    /// Recompute the ledger from every stored row of `level` and persist it.
    ///
    /// Rows are streamed, so memory stays bounded by the cursor batch size.
    /// A level that was never written yields an empty ledger.
    pub async fn rebuild(store: &TableStore, level: &str) -> Result<Self, RecordError> {
        let dataset = store.dataset(level).context(TableSnafu)?;
        let mut cursor = store
            .scan_all(level, DEFAULT_BATCH_SIZE)
            .await
            .context(TableSnafu)?;

        let mut entries: BTreeMap<String, EntitySpan> = BTreeMap::new();
        while let Some(batch) = cursor.next_batch().await.context(TableSnafu)? {
            for row in batch {
                let Some(at) = row.time_key(&dataset.date_column) else {
                    continue;
                };
                let code = match &dataset.code_column {
                    Some(column) => match row.value(column).as_str() {
                        Some(code) => code.to_string(),
                        None => continue,
                    },
                    None => ALL_ENTITIES.to_string(),
                };
                entries
                    .entry(code)
                    .and_modify(|span| span.widen(at))
                    .or_insert(EntitySpan { min: at, max: at });
            }
        }

        let index = Self {
            location: store.level_location(level),
            entries,
        };
        save_json(&index.location, RECORD_FILE_NAME, &index.entries).await?;
        info!(level, entities = index.len(), "rebuilt record index");
        Ok(index)
    }

    /// Span of one entity.
    pub fn get(&self, code: &str) -> Option<EntitySpan> {
        self.entries.get(code).copied()
    }

    /// Span of one entity, falling back to `[min_start, min_start]` for an
    /// entity with no rows.
    pub fn min_and_max(&self, code: &str, min_start: NaiveDate) -> EntitySpan {
        self.get(code).unwrap_or(EntitySpan {
            min: day_start(min_start),
            max: day_start(min_start),
        })
    }

    /// Latest time key across every entity.
    pub fn max_time(&self) -> Option<NaiveDateTime> {
        self.entries.values().map(|span| span.max).max()
    }

    /// Whether an entity has rows.
    pub fn contains(&self, code: &str) -> bool {
        self.entries.contains_key(code)
    }

    /// Tracked entity codes in sorted order.
    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// True when no entity is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of tracked entities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries in code order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, EntitySpan)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Per-entity last successful refresh of one level.
#[derive(Clone, Debug, PartialEq)]
pub struct RefreshTimes {
    location: TableLocation,
    entries: BTreeMap<String, NaiveDateTime>,
}

impl RefreshTimes {
    /// Load the ledger from a level directory; a missing file is empty.
    pub async fn load(location: TableLocation) -> Result<Self, RecordError> {
        let entries = load_json(&location, REFRESH_TIME_FILE_NAME).await?;
        Ok(Self { location, entries })
    }

    /// Last successful refresh of an entity.
    pub fn get(&self, code: &str) -> Option<NaiveDateTime> {
        self.entries.get(code).copied()
    }

    /// Record a successful refresh and persist the ledger.
    pub async fn mark(&mut self, code: &str, at: NaiveDateTime) -> Result<(), RecordError> {
        self.entries.insert(code.to_string(), at);
        save_json(&self.location, REFRESH_TIME_FILE_NAME, &self.entries).await
    }

    /// Forget the refresh times of `codes` and persist the ledger.
    pub async fn reset<'a>(
        &mut self,
        codes: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), RecordError> {
        for code in codes {
            self.entries.remove(code);
        }
        save_json(&self.location, REFRESH_TIME_FILE_NAME, &self.entries).await
    }

    /// Number of entities with a recorded refresh.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing has been refreshed yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DatasetRegistry;
    use crate::dataset::test_util::{daily_quotes, date};
    use crate::row::Row;
    use std::sync::Arc;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const LEVEL: &str = "daily_quote";

    fn quote_store(tmp: &TempDir) -> TableStore {
        let registry = DatasetRegistry::from_descriptors([daily_quotes()]).expect("valid registry");
        TableStore::open(TableLocation::local(tmp.path()), Arc::new(registry))
    }

    fn quote(day: NaiveDate, code: &str) -> Row {
        Row::new().with("date", day).with("code", code)
    }

    #[tokio::test]
    async fn rebuild_tracks_true_min_and_max_per_entity() -> TestResult {
        let tmp = TempDir::new()?;
        let store = quote_store(&tmp);
        store
            .append(
                LEVEL,
                vec![
                    quote(date(2020, 1, 5), "000001"),
                    quote(date(2020, 1, 2), "000001"),
                    quote(date(2020, 1, 3), "000002"),
                ],
            )
            .await?;
        store
            .append(LEVEL, vec![quote(date(2020, 1, 9), "000001")])
            .await?;

        let index = RecordIndex::rebuild(&store, LEVEL).await?;
        assert_eq!(
            index.get("000001"),
            Some(EntitySpan {
                min: day_start(date(2020, 1, 2)),
                max: day_start(date(2020, 1, 9)),
            })
        );
        assert_eq!(index.get("000002").map(|s| s.max), Some(day_start(date(2020, 1, 3))));
        assert_eq!(index.max_time(), Some(day_start(date(2020, 1, 9))));
        assert_eq!(index.codes().collect::<Vec<_>>(), vec!["000001", "000002"]);

        let reloaded = RecordIndex::load(store.level_location(LEVEL)).await?;
        assert_eq!(reloaded, index);
        Ok(())
    }

    #[tokio::test]
    async fn rebuild_of_missing_level_is_empty() -> TestResult {
        let tmp = TempDir::new()?;
        let store = quote_store(&tmp);

        let index = RecordIndex::rebuild(&store, LEVEL).await?;
        assert!(index.is_empty());
        assert_eq!(index.max_time(), None);
        assert_eq!(
            index.min_and_max("000001", date(2020, 1, 1)).min,
            day_start(date(2020, 1, 1))
        );
        Ok(())
    }

    #[tokio::test]
    async fn refresh_times_persist_marks_and_resets() -> TestResult {
        let tmp = TempDir::new()?;
        let location = TableLocation::local(tmp.path().join(LEVEL));
        let at = date(2020, 1, 10).and_hms_opt(10, 0, 0).ok_or("bad time")?;

        let mut times = RefreshTimes::load(location.clone()).await?;
        assert!(times.is_empty());
        times.mark("000001", at).await?;
        times.mark("000002", at).await?;

        let mut reloaded = RefreshTimes::load(location.clone()).await?;
        assert_eq!(reloaded.get("000001"), Some(at));
        assert_eq!(reloaded.len(), 2);

        reloaded.reset(["000001"]).await?;
        let after = RefreshTimes::load(location).await?;
        assert_eq!(after.get("000001"), None);
        assert_eq!(after.get("000002"), Some(at));
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_ledger_is_reported() -> TestResult {
        let tmp = TempDir::new()?;
        tokio::fs::write(tmp.path().join(RECORD_FILE_NAME), "not json").await?;

        let err = RecordIndex::load(TableLocation::local(tmp.path()))
            .await
            .expect_err("corrupt");
        assert!(matches!(err, RecordError::Corrupt { .. }));
        Ok(())
    }
}
