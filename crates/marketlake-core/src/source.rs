//! The contract between the refresh engine and whatever fetches rows.
//!
//! A [`WebSource`] lists the entities a dataset currently has and returns
//! raw rows for a window, either for the whole market or for one entity.
//! The scheduler is its only caller and owns every retry around it; a
//! source reports what happened through [`FetchError`] and never retries on
//! its own.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{dataset::DatasetDescriptor, period::PeriodWindow, row::RawRow};

/// An entity listed by the source.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity {
    /// Entity code.
    pub code: String,
    /// First day the entity has data, when the source knows it.
    #[serde(default)]
    pub inception: Option<NaiveDate>,
}

impl Entity {
    /// Entity with a known inception date.
    pub fn new(code: impl Into<String>, inception: Option<NaiveDate>) -> Self {
        Self {
            code: code.into(),
            inception,
        }
    }
}

/// One fetch: a window, for the whole market or a single entity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchRequest {
    /// Entity code, or `None` for a whole-market request.
    pub entity: Option<String>,
    /// Window to fetch.
    pub window: PeriodWindow,
}

impl FetchRequest {
    /// Whole-market request.
    pub fn market(window: PeriodWindow) -> Self {
        Self {
            entity: None,
            window,
        }
    }

    /// Single-entity request.
    pub fn entity(code: impl Into<String>, window: PeriodWindow) -> Self {
        Self {
            entity: Some(code.into()),
            window,
        }
    }
}

/// Failures a source can report.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FetchError {
    /// Network or remote failure; worth retrying.
    #[snafu(display("Transient fetch failure: {message}"))]
    Transient {
        /// What went wrong.
        message: String,
    },

    /// The window lies entirely in the future; treated as an empty result.
    #[snafu(display("Window {start}..={end} lies in the future"))]
    FutureDate {
        /// Window start.
        start: NaiveDate,
        /// Window end.
        end: NaiveDate,
    },

    /// The source refused the request; retrying will not help.
    #[snafu(display("Fetch rejected: {message}"))]
    Rejected {
        /// What went wrong.
        message: String,
    },
}

impl FetchError {
    /// Whether a retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }
}

/// Source of raw rows for dataset levels.
#[async_trait]
pub trait WebSource: Send + Sync {
    /// Entities currently listed for `dataset`.
    async fn entities(&self, dataset: &DatasetDescriptor) -> Result<Vec<Entity>, FetchError>;

    /// Raw rows for one request. Rows should conform to the dataset's
    /// schema; the scheduler coerces and validates them.
    async fn fetch(
        &self,
        dataset: &DatasetDescriptor,
        request: &FetchRequest,
    ) -> Result<Vec<RawRow>, FetchError>;
}
