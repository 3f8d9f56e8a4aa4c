//! Reconstructing the current table state by replaying log commits.
use std::collections::{BTreeMap, HashMap};

use crate::helpers::segment_order::cmp_segment_meta_by_time;
use crate::transaction_log::*;

/// In-memory view of a level's table, reconstructed from the log.
///
/// Invariant: `version` matches CURRENT, and every other field is the result
/// of applying commits `1..=version` in order.
#[derive(Debug, Clone, PartialEq)]
pub struct TableState {
    /// Latest committed version recorded in CURRENT.
    pub version: u64,
    /// Table-level metadata; the last `UpdateTableMeta` wins.
    pub table_meta: TableMeta,
    /// Current live segments keyed by SegmentId.
    pub segments: HashMap<SegmentId, SegmentMeta>,
    /// Dataset-wide scalar attributes.
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl TableState {
    /// Live segments in deterministic time order.
    pub fn segments_in_order(&self) -> Vec<SegmentMeta> {
        let mut segments: Vec<SegmentMeta> = self.segments.values().cloned().collect();
        segments.sort_unstable_by(cmp_segment_meta_by_time);
        segments
    }

    /// Total live rows.
    pub fn row_count(&self) -> u64 {
        self.segments.values().map(|s| s.row_count).sum()
    }

    /// True when every live segment carries an entity list, i.e. nothing has
    /// been appended since the last index build.
    pub fn is_indexed(&self) -> bool {
        self.segments.values().all(|s| s.entities.is_some())
    }
}

impl TransactionLogStore {
    /// Rebuild the current TableState by replaying all commits up to CURRENT.
    ///
    /// - CURRENT == 0 (no commits) is `CorruptState`; callers that can see a
    ///   never-written level check the version first.
    /// - Some commit must carry an `UpdateTableMeta` action.
    pub async fn rebuild_table_state(&self) -> Result<TableState, CommitError> {
        let current_version = self.load_current_version().await?;

        ensure!(
            current_version != 0,
            CorruptStateSnafu {
                msg: "Cannot rebuild TableState: CURRENT is 0 (no commits)".to_string(),
            }
        );

        let mut table_meta: Option<TableMeta> = None;
        let mut segments: HashMap<SegmentId, SegmentMeta> = HashMap::new();
        let mut attributes = BTreeMap::new();

        for v in 1..=current_version {
            let commit = self.load_commit(v).await?;

            ensure!(
                commit.version == v,
                CorruptStateSnafu {
                    msg: format!(
                        "Commit version mismatch: expected {v}, found {} in payload",
                        commit.version
                    ),
                }
            );

            for action in commit.actions {
                match action {
                    LogAction::AddSegment(meta) => {
                        segments.insert(meta.segment_id.clone(), meta);
                    }
                    LogAction::RemoveSegment { segment_id } => {
                        segments.remove(&segment_id);
                    }
                    LogAction::UpdateTableMeta(meta) => {
                        table_meta = Some(meta);
                    }
                    LogAction::SetAttribute { name, value } => {
                        attributes.insert(name, value);
                    }
                }
            }
        }

        let table_meta = table_meta.context(CorruptStateSnafu {
            msg: format!("No TableMeta found in commits up to version {current_version}"),
        })?;

        Ok(TableState {
            version: current_version,
            table_meta,
            segments,
            attributes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_util::{daily_quotes, date};
    use crate::storage::{StorageError, TableLocation};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn create_test_log_store() -> (TempDir, TransactionLogStore) {
        let tmp = TempDir::new().expect("create temp dir");
        let store = TransactionLogStore::new(TableLocation::local(tmp.path()));
        (tmp, store)
    }

    fn sample_table_meta() -> TableMeta {
        TableMeta::for_dataset(
            &daily_quotes(),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
                .single()
                .expect("valid timestamp"),
        )
    }

    fn sample_segment(id: &str, day: u32) -> SegmentMeta {
        let ts = date(2020, 6, day).and_hms_opt(0, 0, 0).expect("valid time");
        SegmentMeta {
            segment_id: SegmentId(id.to_string()),
            path: format!("data/{id}.parquet"),
            ts_min: ts,
            ts_max: ts,
            row_count: 42,
            entities: None,
        }
    }

    #[tokio::test]
    async fn rebuild_table_state_replays_all_actions() -> TestResult {
        let (_tmp, store) = create_test_log_store();
        let meta = sample_table_meta();
        let seg1 = sample_segment("seg1", 2);
        let seg2 = sample_segment("seg2", 1);

        let v1 = store
            .commit_with_expected_version(0, vec![LogAction::UpdateTableMeta(meta.clone())])
            .await?;
        let v2 = store
            .commit_with_expected_version(
                v1,
                vec![
                    LogAction::AddSegment(seg1.clone()),
                    LogAction::AddSegment(seg2.clone()),
                    LogAction::SetAttribute {
                        name: "level_refresh_time".to_string(),
                        value: serde_json::json!("2020-06-01T09:00:00"),
                    },
                ],
            )
            .await?;

        let state = store.rebuild_table_state().await?;
        assert_eq!(state.version, v2);
        assert_eq!(state.table_meta, meta);
        assert_eq!(state.row_count(), 84);
        assert!(!state.is_indexed());
        assert_eq!(
            state
                .segments_in_order()
                .iter()
                .map(|s| s.segment_id.0.as_str())
                .collect::<Vec<_>>(),
            vec!["seg2", "seg1"]
        );
        assert!(state.attributes.contains_key("level_refresh_time"));

        store
            .commit_with_expected_version(
                v2,
                vec![LogAction::RemoveSegment {
                    segment_id: seg1.segment_id.clone(),
                }],
            )
            .await?;
        let state = store.rebuild_table_state().await?;
        assert!(!state.segments.contains_key(&seg1.segment_id));
        assert!(state.segments.contains_key(&seg2.segment_id));
        Ok(())
    }

    #[tokio::test]
    async fn rebuild_table_state_errors_when_current_zero() {
        let (_tmp, store) = create_test_log_store();
        let err = store.rebuild_table_state().await.expect_err("expected error");
        assert!(matches!(err, CommitError::CorruptState { .. }));
    }

    #[tokio::test]
    async fn rebuild_table_state_errors_when_no_table_meta() -> TestResult {
        let (_tmp, store) = create_test_log_store();
        store
            .commit_with_expected_version(0, vec![LogAction::AddSegment(sample_segment("s", 1))])
            .await?;

        let err = store.rebuild_table_state().await.expect_err("expected error");
        assert!(matches!(err, CommitError::CorruptState { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn rebuild_table_state_fails_when_commit_missing() -> TestResult {
        let (tmp, store) = create_test_log_store();
        store
            .commit_with_expected_version(0, vec![LogAction::UpdateTableMeta(sample_table_meta())])
            .await?;

        tokio::fs::remove_file(
            tmp.path()
                .join(TransactionLogStore::LOG_DIR_NAME)
                .join("0000000001.json"),
        )
        .await?;

        let err = store.rebuild_table_state().await.expect_err("expected error");
        assert!(matches!(
            err,
            CommitError::Storage {
                source: StorageError::NotFound { .. }
            }
        ));
        Ok(())
    }
}
