//! Per-run cache of a level's ledgers.

use crate::{
    record::{RecordError, RecordIndex, RefreshTimes},
    storage::TableLocation,
};

/// Ledgers of one level, loaded lazily and scoped to one scheduler run.
///
/// Each cache starts empty and is filled from disk on first use. The record
/// index is replaced wholesale after a rebuild; refresh times are updated in
/// place by [`RefreshTimes::mark`], which also persists them.
#[derive(Debug)]
pub struct RefreshContext {
    location: TableLocation,
    record: Option<RecordIndex>,
    refresh_times: Option<RefreshTimes>,
}

impl RefreshContext {
    /// Empty context for the level stored at `location`.
    pub fn new(location: TableLocation) -> Self {
        Self {
            location,
            record: None,
            refresh_times: None,
        }
    }

    /// The record index, loaded on first access.
    pub async fn record(&mut self) -> Result<&RecordIndex, RecordError> {
        let record = match self.record.take() {
            Some(record) => record,
            None => RecordIndex::load(self.location.clone()).await?,
        };
        Ok(self.record.insert(record))
    }

    /// The refresh times, loaded on first access.
    pub async fn refresh_times(&mut self) -> Result<&mut RefreshTimes, RecordError> {
        let times = match self.refresh_times.take() {
            Some(times) => times,
            None => RefreshTimes::load(self.location.clone()).await?,
        };
        Ok(self.refresh_times.insert(times))
    }

    /// Install a freshly rebuilt record index.
    pub fn set_record(&mut self, record: RecordIndex) {
        self.record = Some(record);
    }

    /// Drop both caches so the next access reloads from disk.
    pub fn invalidate(&mut self) {
        self.record = None;
        self.refresh_times = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn caches_load_lazily_and_reload_after_invalidate() -> TestResult {
        let tmp = TempDir::new()?;
        let location = TableLocation::local(tmp.path());
        let at = NaiveDate::from_ymd_opt(2020, 1, 10)
            .and_then(|d| d.and_hms_opt(10, 0, 0))
            .ok_or("bad time")?;

        let mut ctx = RefreshContext::new(location.clone());
        assert!(ctx.record().await?.is_empty());
        ctx.refresh_times().await?.mark("000001", at).await?;
        assert_eq!(ctx.refresh_times().await?.get("000001"), Some(at));

        // Another writer changes the ledger on disk.
        let mut other = RefreshTimes::load(location).await?;
        other.mark("000002", at).await?;
        assert_eq!(ctx.refresh_times().await?.get("000002"), None);

        ctx.invalidate();
        assert_eq!(ctx.refresh_times().await?.get("000002"), Some(at));
        Ok(())
    }
}
