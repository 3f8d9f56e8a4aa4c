//! Incremental refresh of dataset levels.
//!
//! One call to [`RefreshScheduler::run_level_at`] takes a level through the
//! whole state machine while holding its [`AccessGuard`] lock:
//!
//! 1. **Gate**: skip the level when its last refresh is not yet a day old
//!    under the clock's anchor hour.
//! 2. **Bulk window**: resume from the latest stored time key, stepped back
//!    one day for day-level cadences, two quarter ends for quarterly
//!    datasets and two year starts for yearly ones. An empty ledger resumes
//!    from the dataset's `min_start`.
//! 3. **Bulk refresh**: fetch the window up to today for the whole market,
//!    chunked by the planner (the period in progress included), then
//!    replace the fetched range in a single commit. A chunk that exhausts
//!    its retries aborts the level before anything is deleted.
//! 4. **Discovery**: entities the source lists that the ledger does not
//!    know yet. Skipped on a first run, when the bulk window already covers
//!    everything.
//! 5. **Backfill**: for each new entity that is due, fetch from its
//!    inception (back-dated for report datasets) to the day before the bulk
//!    window. Fetches run concurrently; appends go through one writer.
//!    Failures are retried on later passes.
//! 6. **Rebuild**: compact the index, then recompute the record ledger.
//! 7. **Stamp** the level with the refresh instant.
//!
//! Levels with cadence `none` replace steps 2 to 5 with a read, merge and
//! overwrite of the whole table.

pub mod context;

pub use context::RefreshContext;

use std::{
    collections::{HashMap, HashSet, hash_map::Entry},
    sync::Arc,
};

use chrono::{Local, NaiveDate, NaiveDateTime};
use futures::{StreamExt, stream};
use serde::Serialize;
use snafu::prelude::*;
use tracing::{debug, error, info, warn};

use crate::{
    clock::{RefreshCadence, RefreshClock},
    config::EngineConfig,
    dataset::{Cadence, DatasetDescriptor, DatasetError},
    guard::{AccessGuard, GuardError},
    helpers::calendar,
    period::{PeriodPlanner, PeriodWindow},
    predicate::{CompareOp, Predicate, membership},
    record::{RecordError, RecordIndex},
    row::{RawRow, Row, coerce_row, parse_timestamp},
    source::{Entity, FetchError, FetchRequest, WebSource},
    table::{QueryOptions, TableError, TableStore},
};

/// Table attribute holding a level's last successful refresh.
pub const LEVEL_REFRESH_ATTR: &str = "level_refresh_time";

/// Errors that abort a level's run.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SchedulerError {
    /// The level is locked by another session, or the lock file failed.
    #[snafu(display("{source}"))]
    Guard {
        /// Underlying lock error.
        source: GuardError,
    },

    /// A table store operation failed.
    #[snafu(display("Level {level}: {source}"))]
    Table {
        /// Level name.
        level: String,
        /// Underlying table error.
        source: TableError,
    },

    /// Loading or saving a ledger failed.
    #[snafu(display("Level {level}: {source}"))]
    Record {
        /// Level name.
        level: String,
        /// Underlying ledger error.
        source: RecordError,
    },

    /// The dataset descriptor cannot be used.
    #[snafu(display("{source}"))]
    Dataset {
        /// Underlying descriptor error.
        source: DatasetError,
    },

    /// A whole-market fetch failed after retries; nothing was deleted.
    #[snafu(display("Level {level}: bulk fetch of {start}..={end} failed: {source}"))]
    BulkFetch {
        /// Level name.
        level: String,
        /// Window start.
        start: NaiveDate,
        /// Window end.
        end: NaiveDate,
        /// Last fetch error.
        source: FetchError,
    },

    /// Listing the level's entities failed after retries.
    #[snafu(display("Level {level}: listing entities failed: {source}"))]
    EntityListing {
        /// Level name.
        level: String,
        /// Last fetch error.
        source: FetchError,
    },

    /// A requested entity code does not match the level's code pattern.
    #[snafu(display("Level {level}: invalid entity code {code}"))]
    InvalidCode {
        /// Level name.
        level: String,
        /// Offending code.
        code: String,
    },

    /// The operation needs an entity code column the level does not have.
    #[snafu(display("Level {level} has no entity code column"))]
    NoCodeColumn {
        /// Level name.
        level: String,
    },
}

/// Counts and entity lists from one refreshed level.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RefreshSummary {
    /// First day of the bulk window, when a bulk refresh ran.
    pub bulk_start: Option<NaiveDate>,
    /// Rows fetched by the bulk refresh (or the overwrite fetch).
    pub bulk_rows: u64,
    /// Stored rows deleted before re-inserting.
    pub removed_rows: u64,
    /// Rows dropped as duplicates of stored keys.
    pub duplicates_dropped: u64,
    /// Fetched rows rejected by schema coercion.
    pub rejected_rows: u64,
    /// Entities listed by the source but absent from the ledger.
    pub new_entities: Vec<String>,
    /// Entities whose backfill succeeded.
    pub backfilled: Vec<String>,
    /// Rows appended by backfills.
    pub backfill_rows: u64,
    /// Entities still failing after every backfill pass.
    pub failed: Vec<String>,
    /// Rows written by a whole-table overwrite (cadence `none`).
    pub overwritten: Option<u64>,
}

/// What happened to a level.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LevelOutcome {
    /// Not due yet.
    Skipped {
        /// When the level becomes due.
        next_eligible: NaiveDateTime,
    },
    /// Refreshed.
    Refreshed(RefreshSummary),
}

/// Result of one level's run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LevelReport {
    /// Level name.
    pub level: String,
    /// Outcome.
    #[serde(flatten)]
    pub outcome: LevelOutcome,
}

/// Typed rows from one or more fetches.
#[derive(Debug, Default)]
struct Normalized {
    rows: Vec<Row>,
    rejected: u64,
}

impl Normalized {
    fn merge(&mut self, other: Normalized) {
        self.rows.extend(other.rows);
        self.rejected += other.rejected;
    }
}

#[derive(Debug, Default)]
struct BackfillOutcome {
    backfilled: Vec<String>,
    failed: Vec<String>,
    rows: u64,
    duplicates: u64,
    rejected: u64,
}

/// Drives refreshes of the levels in a [`TableStore`] from a [`WebSource`].
pub struct RefreshScheduler {
    store: TableStore,
    source: Arc<dyn WebSource>,
    config: EngineConfig,
    guard: AccessGuard,
}

impl RefreshScheduler {
    /// Scheduler over `store`, locking levels under the store root.
    pub fn new(store: TableStore, source: Arc<dyn WebSource>, config: EngineConfig) -> Self {
        let guard = AccessGuard::new(store.root().clone());
        Self {
            store,
            source,
            config,
            guard,
        }
    }

    /// Underlying store.
    pub fn store(&self) -> &TableStore {
        &self.store
    }

    /// Lock manager used for every session.
    pub fn guard(&self) -> &AccessGuard {
        &self.guard
    }

    /// Refresh `levels` (every registered level when empty) one after the
    /// other, stopping at the first error.
    pub async fn run(&self, levels: &[String]) -> Result<Vec<LevelReport>, SchedulerError> {
        self.run_at(levels, Local::now().naive_local()).await
    }

    /// [`run`](Self::run) with an explicit clock.
    pub async fn run_at(
        &self,
        levels: &[String],
        now: NaiveDateTime,
    ) -> Result<Vec<LevelReport>, SchedulerError> {
        let levels: Vec<String> = if levels.is_empty() {
            self.store.registry().names().map(str::to_string).collect()
        } else {
            levels.to_vec()
        };

        let mut reports = Vec::with_capacity(levels.len());
        for level in &levels {
            reports.push(self.run_level_at(level, now).await?);
        }
        Ok(reports)
    }

    /// Refresh one level now.
    pub async fn run_level(&self, level: &str) -> Result<LevelReport, SchedulerError> {
        self.run_level_at(level, Local::now().naive_local()).await
    }

    /// Refresh one level as of `now`, holding its lock throughout.
    pub async fn run_level_at(
        &self,
        level: &str,
        now: NaiveDateTime,
    ) -> Result<LevelReport, SchedulerError> {
        let dataset = self.store.dataset(level).context(TableSnafu { level })?;
        let session = self.guard.enter(level).await.context(GuardSnafu)?;

        let result = self.refresh_locked(dataset, now).await;
        let released = session.release().await.context(GuardSnafu);

        let report = result?;
        released?;
        Ok(report)
    }

    /// Re-initialize entities: delete their rows, forget their refresh
    /// times and backfill them from inception up to `now`.
    pub async fn reinit(
        &self,
        level: &str,
        codes: &[String],
        now: NaiveDateTime,
    ) -> Result<RefreshSummary, SchedulerError> {
        let dataset = self.store.dataset(level).context(TableSnafu { level })?;
        let code_column = dataset
            .code_column
            .as_deref()
            .context(NoCodeColumnSnafu { level })?;
        let pattern = dataset.code_regex().context(DatasetSnafu)?;
        for code in codes {
            ensure!(
                pattern.is_match(code),
                InvalidCodeSnafu {
                    level,
                    code: code.as_str(),
                }
            );
        }

        let session = self.guard.enter(level).await.context(GuardSnafu)?;
        let result = self.reinit_locked(dataset, code_column, codes, now).await;
        let released = session.release().await.context(GuardSnafu);

        let summary = result?;
        released?;
        Ok(summary)
    }

    async fn refresh_locked(
        &self,
        dataset: &DatasetDescriptor,
        now: NaiveDateTime,
    ) -> Result<LevelReport, SchedulerError> {
        let level = dataset.name.as_str();
        let clock = RefreshClock::new(dataset.min_start, self.config.anchor());

        let last = self.level_last_refresh(level).await?;
        let next_eligible = clock.next_eligible(last, RefreshCadence::Daily);
        if next_eligible > now {
            info!(level, %next_eligible, "level not due; skipping");
            return Ok(LevelReport {
                level: level.to_string(),
                outcome: LevelOutcome::Skipped { next_eligible },
            });
        }

        let mut ctx = RefreshContext::new(self.store.level_location(level));
        let summary = match dataset.cadence {
            Cadence::None => self.refresh_overwrite(dataset, now).await?,
            _ => self.refresh_incremental(dataset, &clock, &mut ctx, now).await?,
        };

        self.rebuild_ledgers(level, &mut ctx).await?;
        self.store
            .set_attr(
                level,
                LEVEL_REFRESH_ATTR,
                serde_json::Value::String(now.format("%Y-%m-%dT%H:%M:%S").to_string()),
            )
            .await
            .context(TableSnafu { level })?;

        info!(
            level,
            bulk_rows = summary.bulk_rows,
            removed = summary.removed_rows,
            duplicates = summary.duplicates_dropped,
            new_entities = summary.new_entities.len(),
            backfilled = summary.backfilled.len(),
            failed = summary.failed.len(),
            "level refreshed"
        );
        Ok(LevelReport {
            level: level.to_string(),
            outcome: LevelOutcome::Refreshed(summary),
        })
    }

    async fn level_last_refresh(
        &self,
        level: &str,
    ) -> Result<Option<NaiveDateTime>, SchedulerError> {
        let value = self
            .store
            .get_attr(level, LEVEL_REFRESH_ATTR)
            .await
            .context(TableSnafu { level })?;

        Ok(match value {
            None => None,
            Some(serde_json::Value::String(s)) => {
                let parsed = parse_timestamp(&s);
                if parsed.is_none() {
                    warn!(level, value = %s, "ignoring unreadable level refresh time");
                }
                parsed
            }
            Some(other) => {
                warn!(level, value = %other, "ignoring unreadable level refresh time");
                None
            }
        })
    }

    async fn refresh_incremental(
        &self,
        dataset: &DatasetDescriptor,
        clock: &RefreshClock,
        ctx: &mut RefreshContext,
        now: NaiveDateTime,
    ) -> Result<RefreshSummary, SchedulerError> {
        let level = dataset.name.as_str();
        let planner = PeriodPlanner::new(now.date());
        let record = ctx.record().await.context(RecordSnafu { level })?.clone();
        let start = bulk_start(dataset, record.max_time());

        let mut summary = RefreshSummary::default();
        if start > planner.today() {
            info!(level, %start, "bulk window starts after today; nothing to refresh");
        } else {
            summary.bulk_start = Some(start);
            self.bulk_refresh(dataset, &planner, start, &mut summary)
                .await?;
        }

        if record.is_empty() || dataset.code_column.is_none() {
            return Ok(summary);
        }

        let new_entities = self.discover(dataset, &record).await?;
        summary.new_entities = new_entities.iter().map(|e| e.code.clone()).collect();
        if new_entities.is_empty() {
            return Ok(summary);
        }
        info!(level, count = new_entities.len(), "discovered new entities");

        let outcome = self
            .backfill(
                dataset,
                clock,
                &planner,
                ctx,
                new_entities,
                calendar::pred(start),
                now,
            )
            .await?;
        summary.backfilled = outcome.backfilled;
        summary.failed = outcome.failed;
        summary.backfill_rows = outcome.rows;
        summary.duplicates_dropped += outcome.duplicates;
        summary.rejected_rows += outcome.rejected;
        Ok(summary)
    }

    async fn bulk_refresh(
        &self,
        dataset: &DatasetDescriptor,
        planner: &PeriodPlanner,
        start: NaiveDate,
        summary: &mut RefreshSummary,
    ) -> Result<(), SchedulerError> {
        let level = dataset.name.as_str();
        // The period still in progress is fetched too, clipped to today.
        let windows = planner.plan(start, planner.today(), dataset.fetch_unit(), false);
        let Some(covered_end) = windows.last().map(|w| w.end) else {
            info!(level, %start, "no fetchable period in bulk window");
            return Ok(());
        };

        let mut fetched = Normalized::default();
        for window in windows {
            let request = FetchRequest::market(window);
            match self.fetch_with_retry(dataset, &request).await {
                Ok(raw) => fetched.merge(normalize(dataset, raw, &request)),
                Err(FetchError::FutureDate { .. }) => {
                    debug!(level, start = %window.start, end = %window.end, "window in the future");
                }
                Err(source) => {
                    error!(
                        level,
                        start = %window.start,
                        end = %window.end,
                        error = %source,
                        "bulk fetch failed; aborting level"
                    );
                    return Err(SchedulerError::BulkFetch {
                        level: level.to_string(),
                        start: window.start,
                        end: window.end,
                        source,
                    });
                }
            }
        }

        let predicate = Predicate::compare(&dataset.date_column, CompareOp::Ge, start).and(
            Predicate::compare(&dataset.date_column, CompareOp::Lt, calendar::succ(covered_end)),
        );
        summary.bulk_rows = fetched.rows.len() as u64;
        summary.rejected_rows += fetched.rejected;

        let report = self
            .store
            .replace(level, &predicate, fetched.rows)
            .await
            .context(TableSnafu { level })?;
        summary.removed_rows = report.removed;
        summary.duplicates_dropped += report.duplicates_dropped;

        info!(
            level,
            %start,
            end = %covered_end,
            rows = report.appended,
            removed = report.removed,
            "bulk refresh committed"
        );
        Ok(())
    }

    async fn discover(
        &self,
        dataset: &DatasetDescriptor,
        record: &RecordIndex,
    ) -> Result<Vec<Entity>, SchedulerError> {
        let level = dataset.name.as_str();
        let listed = self.list_entities(dataset).await?;
        let pattern = dataset.code_regex().context(DatasetSnafu)?;

        let mut seen = HashSet::new();
        Ok(listed
            .into_iter()
            .filter(|entity| {
                if !pattern.is_match(&entity.code) {
                    warn!(level, entity = %entity.code, "ignoring listed entity with invalid code");
                    return false;
                }
                !record.contains(&entity.code) && seen.insert(entity.code.clone())
            })
            .collect())
    }

    #[allow(clippy::too_many_arguments)]
    async fn backfill(
        &self,
        dataset: &DatasetDescriptor,
        clock: &RefreshClock,
        planner: &PeriodPlanner,
        ctx: &mut RefreshContext,
        entities: Vec<Entity>,
        end: NaiveDate,
        now: NaiveDateTime,
    ) -> Result<BackfillOutcome, SchedulerError> {
        let level = dataset.name.as_str();
        let times = ctx.refresh_times().await.context(RecordSnafu { level })?;
        let cadence = dataset.cadence.refresh_cadence();

        let mut pending: Vec<(String, NaiveDate)> = Vec::new();
        for entity in entities {
            let Some(inception) = entity.inception else {
                debug!(level, entity = %entity.code, "no inception date; skipping backfill");
                continue;
            };
            if !clock.is_due(times.get(&entity.code), cadence, now) {
                debug!(level, entity = %entity.code, "entity not due; skipping backfill");
                continue;
            }
            pending.push((entity.code, inception));
        }

        let workers = self.config.workers.max(1);
        let mut outcome = BackfillOutcome::default();

        for pass in 1..=self.config.backfill_passes.max(1) {
            if pending.is_empty() {
                break;
            }
            info!(level, pass, entities = pending.len(), "backfill pass");

            let mut failed = Vec::new();
            let mut results = stream::iter(pending)
                .map(move |(code, inception)| async move {
                    let result = self
                        .fetch_entity(dataset, planner, &code, inception, end)
                        .await;
                    (code, inception, result)
                })
                .buffer_unordered(workers);

            while let Some((code, inception, result)) = results.next().await {
                match result {
                    Ok(fetched) => {
                        outcome.rejected += fetched.rejected;
                        let report = self
                            .store
                            .append(level, fetched.rows)
                            .await
                            .context(TableSnafu { level })?;
                        times.mark(&code, now).await.context(RecordSnafu { level })?;
                        debug!(level, entity = %code, rows = report.appended, "backfilled entity");
                        outcome.rows += report.appended;
                        outcome.duplicates += report.duplicates_dropped;
                        outcome.backfilled.push(code);
                    }
                    Err(e) => {
                        warn!(level, entity = %code, pass, error = %e, "backfill fetch failed");
                        failed.push((code, inception));
                    }
                }
            }

            if !failed.is_empty() {
                let codes: Vec<&str> = failed.iter().map(|(c, _)| c.as_str()).collect();
                warn!(level, pass, failed = ?codes, "backfill pass finished with failures");
            }
            pending = failed;
        }

        outcome.failed = pending.into_iter().map(|(code, _)| code).collect();
        outcome.backfilled.sort();
        outcome.failed.sort();
        Ok(outcome)
    }

    async fn fetch_entity(
        &self,
        dataset: &DatasetDescriptor,
        planner: &PeriodPlanner,
        code: &str,
        inception: NaiveDate,
        end: NaiveDate,
    ) -> Result<Normalized, FetchError> {
        let start = calendar::shift_days(inception, -dataset.report_lookback_days.unwrap_or(0));
        let mut fetched = Normalized::default();

        for window in planner.plan_for_entity(start, end, dataset.fetch_unit(), false) {
            let request = FetchRequest::entity(code, window);
            match self.fetch_with_retry(dataset, &request).await {
                Ok(raw) => fetched.merge(normalize(dataset, raw, &request)),
                Err(FetchError::FutureDate { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(fetched)
    }

    async fn refresh_overwrite(
        &self,
        dataset: &DatasetDescriptor,
        now: NaiveDateTime,
    ) -> Result<RefreshSummary, SchedulerError> {
        let level = dataset.name.as_str();
        let window = PeriodWindow::range(dataset.min_start, now.date());
        let request = FetchRequest::market(window);

        let raw = match self.fetch_with_retry(dataset, &request).await {
            Ok(raw) => raw,
            Err(FetchError::FutureDate { .. }) => Vec::new(),
            Err(source) => {
                return Err(SchedulerError::BulkFetch {
                    level: level.to_string(),
                    start: window.start,
                    end: window.end,
                    source,
                });
            }
        };
        let fetched = normalize(dataset, raw, &request);

        let local = match self.store.query(level, &QueryOptions::default()).await {
            Ok(rows) => rows,
            Err(e) if e.is_missing_table() => Vec::new(),
            Err(source) => {
                return Err(SchedulerError::Table {
                    level: level.to_string(),
                    source,
                });
            }
        };

        let mut summary = RefreshSummary {
            bulk_rows: fetched.rows.len() as u64,
            rejected_rows: fetched.rejected,
            removed_rows: local.len() as u64,
            ..RefreshSummary::default()
        };
        let merged = merge_prefer_latest(&dataset.key_columns(), local, fetched.rows);
        let report = self
            .store
            .put(level, merged)
            .await
            .context(TableSnafu { level })?;
        summary.overwritten = Some(report.appended);
        summary.duplicates_dropped = report.duplicates_dropped;
        Ok(summary)
    }

    async fn reinit_locked(
        &self,
        dataset: &DatasetDescriptor,
        code_column: &str,
        codes: &[String],
        now: NaiveDateTime,
    ) -> Result<RefreshSummary, SchedulerError> {
        let level = dataset.name.as_str();
        let mut summary = RefreshSummary::default();

        if let Some(predicate) = membership(code_column, codes.iter().map(String::as_str)) {
            match self.store.remove(level, &predicate).await {
                Ok(removed) => summary.removed_rows = removed,
                Err(e) if e.is_missing_table() => {}
                Err(source) => {
                    return Err(SchedulerError::Table {
                        level: level.to_string(),
                        source,
                    });
                }
            }
        }

        let mut ctx = RefreshContext::new(self.store.level_location(level));
        ctx.refresh_times()
            .await
            .context(RecordSnafu { level })?
            .reset(codes.iter().map(String::as_str))
            .await
            .context(RecordSnafu { level })?;

        let inceptions: HashMap<String, Option<NaiveDate>> = self
            .list_entities(dataset)
            .await?
            .into_iter()
            .map(|e| (e.code, e.inception))
            .collect();
        let entities: Vec<Entity> = codes
            .iter()
            .map(|code| {
                let inception = inceptions.get(code).copied().flatten();
                Entity::new(code.clone(), Some(inception.unwrap_or(dataset.min_start)))
            })
            .collect();

        let clock = RefreshClock::new(dataset.min_start, self.config.anchor());
        let planner = PeriodPlanner::new(now.date());
        let outcome = self
            .backfill(dataset, &clock, &planner, &mut ctx, entities, now.date(), now)
            .await?;
        summary.backfilled = outcome.backfilled;
        summary.failed = outcome.failed;
        summary.backfill_rows = outcome.rows;
        summary.duplicates_dropped = outcome.duplicates;
        summary.rejected_rows = outcome.rejected;

        self.rebuild_ledgers(level, &mut ctx).await?;
        info!(
            level,
            removed = summary.removed_rows,
            backfilled = summary.backfilled.len(),
            failed = summary.failed.len(),
            "re-initialized entities"
        );
        Ok(summary)
    }

    async fn rebuild_ledgers(
        &self,
        level: &str,
        ctx: &mut RefreshContext,
    ) -> Result<(), SchedulerError> {
        if self.store.exists(level).await.context(TableSnafu { level })? {
            self.store
                .create_index(level)
                .await
                .context(TableSnafu { level })?;
        }
        let record = RecordIndex::rebuild(&self.store, level)
            .await
            .context(RecordSnafu { level })?;
        ctx.set_record(record);
        Ok(())
    }

    async fn list_entities(
        &self,
        dataset: &DatasetDescriptor,
    ) -> Result<Vec<Entity>, SchedulerError> {
        let label = format!("{} entities", dataset.name);
        self.config
            .retry
            .run(&label, || self.source.entities(dataset))
            .await
            .context(EntityListingSnafu {
                level: dataset.name.as_str(),
            })
    }

    async fn fetch_with_retry(
        &self,
        dataset: &DatasetDescriptor,
        request: &FetchRequest,
    ) -> Result<Vec<RawRow>, FetchError> {
        let window = &request.window;
        let label = match &request.entity {
            Some(code) => format!("{}/{code} {}..={}", dataset.name, window.start, window.end),
            None => format!("{} {}..={}", dataset.name, window.start, window.end),
        };
        self.config
            .retry
            .run(&label, || self.source.fetch(dataset, request))
            .await
    }
}

/// First day of the bulk window given the latest stored time key.
///
/// The step back is a heuristic margin against late corrections at the
/// source: one day for day-level cadences, two quarter ends for quarterly
/// and two year starts for yearly datasets.
pub fn bulk_start(dataset: &DatasetDescriptor, latest: Option<NaiveDateTime>) -> NaiveDate {
    let Some(latest) = latest else {
        return dataset.min_start;
    };
    let day = latest.date();
    let start = match dataset.cadence {
        Cadence::Quarterly => calendar::quarter_end_back(day, 2),
        Cadence::Yearly => calendar::year_begin_back(day, 2),
        Cadence::None | Cadence::Daily | Cadence::BusinessDay => calendar::pred(day),
    };
    start.max(dataset.min_start)
}

/// Coerce fetched rows, dropping rows that fail the schema and rows that
/// fall outside the requested window or entity.
fn normalize(dataset: &DatasetDescriptor, raw: Vec<RawRow>, request: &FetchRequest) -> Normalized {
    let level = dataset.name.as_str();
    let mut out = Normalized::default();
    let mut outside = 0_usize;

    for raw_row in raw {
        let row = match coerce_row(&raw_row, dataset) {
            Ok(row) => row,
            Err(e) => {
                warn!(level, error = %e, "rejected fetched row");
                out.rejected += 1;
                continue;
            }
        };

        let in_window = row
            .time_key(&dataset.date_column)
            .is_some_and(|t| request.window.contains(t.date()));
        let right_entity = match (&request.entity, &dataset.code_column) {
            (Some(code), Some(column)) => row.value(column).as_str() == Some(code.as_str()),
            _ => true,
        };
        if in_window && right_entity {
            out.rows.push(row);
        } else {
            outside += 1;
        }
    }

    if outside > 0 {
        debug!(level, outside, "dropped rows outside the requested window");
    }
    out
}

/// Merge two row sets on `keys`; a later row replaces an earlier one with
/// the same key in place.
fn merge_prefer_latest(keys: &[&str], local: Vec<Row>, fetched: Vec<Row>) -> Vec<Row> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut merged: Vec<Row> = Vec::with_capacity(local.len() + fetched.len());
    for row in local.into_iter().chain(fetched) {
        match positions.entry(row.key_of(keys)) {
            Entry::Occupied(slot) => merged[*slot.get()] = row,
            Entry::Vacant(slot) => {
                slot.insert(merged.len());
                merged.push(row);
            }
        }
    }
    merged
}
