//! Splitting a date range into fetchable windows.
//!
//! Sources cap how many rows a single whole-market request may return, so a
//! refresh range is chunked into calendar periods before it is fetched. The
//! planner walks the periods that intersect `[start, end]`, drops a period
//! whose *unclipped* end lies after today when future exclusion is on, and
//! clips the rest to the requested range. Output windows are ascending,
//! pairwise disjoint and never empty.
//!
//! Quarter and year periods carry their period identity in [`WindowKey`] so
//! sources that page by report period can use it directly.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::helpers::calendar;

/// Calendar unit used to chunk a range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodUnit {
    /// One window per calendar day.
    Day,
    /// One window per business day; weekends produce no window.
    BusinessDay,
    /// Monday through Sunday.
    Week,
    /// Calendar month.
    Month,
    /// Calendar quarter.
    Quarter,
    /// Calendar year.
    Year,
}

impl PeriodUnit {
    /// Day-level units whose per-entity requests can be served in one shot.
    pub fn is_day_level(self) -> bool {
        matches!(self, PeriodUnit::Day | PeriodUnit::BusinessDay)
    }
}

/// Identity of the period a window was cut from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WindowKey {
    /// A literal date range.
    Range,
    /// A calendar quarter.
    Quarter {
        /// Calendar year.
        year: i32,
        /// Quarter number, 1..=4.
        quarter: u32,
    },
    /// A calendar year.
    Year {
        /// Calendar year.
        year: i32,
    },
}

/// A closed date window `[start, end]` handed to the source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeriodWindow {
    /// First day, inclusive.
    pub start: NaiveDate,
    /// Last day, inclusive.
    pub end: NaiveDate,
    /// Period identity.
    pub key: WindowKey,
}

impl PeriodWindow {
    /// A literal range window.
    pub fn range(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start,
            end,
            key: WindowKey::Range,
        }
    }

    /// Whether `day` falls inside the window.
    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }
}

/// Chunks ranges into windows relative to a fixed "today".
#[derive(Clone, Copy, Debug)]
pub struct PeriodPlanner {
    today: NaiveDate,
}

impl PeriodPlanner {
    /// Planner whose future exclusion is measured against `today`.
    pub fn new(today: NaiveDate) -> Self {
        Self { today }
    }

    /// Day the planner treats as today.
    pub fn today(&self) -> NaiveDate {
        self.today
    }

    /// Windows covering `[start, end]` for a whole-market request.
    pub fn plan(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        unit: PeriodUnit,
        exclude_future: bool,
    ) -> Vec<PeriodWindow> {
        let mut windows = Vec::new();
        if start > end {
            return windows;
        }

        let mut cursor = start;
        loop {
            let (p_start, p_end) = period_bounds(unit, cursor);
            let future = exclude_future && p_end > self.today;
            let closed = unit == PeriodUnit::BusinessDay && !calendar::is_business_day(p_start);

            if !future && !closed {
                let s = p_start.max(start);
                let e = p_end.min(end);
                if s <= e {
                    windows.push(PeriodWindow {
                        start: s,
                        end: e,
                        key: window_key(unit, p_start),
                    });
                }
            }

            if p_end >= end || p_end == NaiveDate::MAX {
                break;
            }
            cursor = calendar::succ(p_end);
        }

        windows
    }

    /// Windows covering `[start, end]` for a single entity.
    ///
    /// Per-entity requests at day granularity are served by the source in
    /// one shot, so the whole range collapses into a single window (clipped
    /// to today when future exclusion is on). Coarser units are chunked the
    /// same way as whole-market requests.
    pub fn plan_for_entity(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        unit: PeriodUnit,
        exclude_future: bool,
    ) -> Vec<PeriodWindow> {
        if !unit.is_day_level() {
            return self.plan(start, end, unit, exclude_future);
        }

        let end = if exclude_future {
            end.min(self.today)
        } else {
            end
        };
        if start > end {
            return Vec::new();
        }
        vec![PeriodWindow::range(start, end)]
    }
}

/// Unclipped bounds of the `unit` period containing `day`.
fn period_bounds(unit: PeriodUnit, day: NaiveDate) -> (NaiveDate, NaiveDate) {
    match unit {
        PeriodUnit::Day | PeriodUnit::BusinessDay => (day, day),
        PeriodUnit::Week => (calendar::week_start(day), calendar::week_end(day)),
        PeriodUnit::Month => (calendar::month_start(day), calendar::month_end(day)),
        PeriodUnit::Quarter => {
            let q = calendar::quarter_of(day);
            (
                calendar::quarter_start(day.year(), q),
                calendar::quarter_end(day.year(), q),
            )
        }
        PeriodUnit::Year => (
            calendar::year_start(day.year()),
            calendar::year_end(day.year()),
        ),
    }
}

fn window_key(unit: PeriodUnit, period_start: NaiveDate) -> WindowKey {
    match unit {
        PeriodUnit::Quarter => WindowKey::Quarter {
            year: period_start.year(),
            quarter: calendar::quarter_of(period_start),
        },
        PeriodUnit::Year => WindowKey::Year {
            year: period_start.year(),
        },
        _ => WindowKey::Range,
    }
}
