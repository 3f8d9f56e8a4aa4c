//! Next-eligible refresh instants.
//!
//! [`RefreshClock::next_eligible`] answers "given when this was last
//! refreshed successfully, when may it be refreshed again?". The same clock
//! throttles a whole level (with a daily cadence) and individual entities
//! (with the dataset's own cadence).
//!
//! Anchor semantics per cadence:
//!
//! - Never refreshed: the dataset's minimum start date, at midnight.
//! - Minutes / hours: floor `last` to the unit, then advance `n` units.
//! - Daily: today at the anchor hour if `last` is still before it,
//!   otherwise the next day at the anchor hour.
//! - Business day: as daily on a business day, skipping to the next
//!   business day; a weekend `last` always moves to the next business day.
//! - Weekly / monthly / quarterly / yearly: the start of the next period
//!   strictly after `last`'s day, or the last day of that next period when
//!   the clock is anchored on period ends. A `last` sitting exactly on a
//!   boundary still advances a full period.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::helpers::calendar;

/// Default hour of day at which daily refreshes become eligible.
pub const DEFAULT_ANCHOR_HOUR: u32 = 9;

/// Refresh cadence understood by the clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshCadence {
    /// Every `n` minutes.
    Minutes(u32),
    /// Every `n` hours.
    Hours(u32),
    /// Once per calendar day.
    Daily,
    /// Once per business day.
    BusinessDay,
    /// Once per week.
    Weekly,
    /// Once per month.
    Monthly,
    /// Once per quarter.
    Quarterly,
    /// Once per year.
    Yearly,
}

/// Which edge of a calendar period a coarse cadence lands on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryEdge {
    /// First day of the next period.
    #[default]
    Start,
    /// Last day of the next period.
    End,
}

/// Where within a day or a period the next refresh is anchored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    /// Hour of day (0..=23) for daily and business-day cadences.
    pub hour: u32,
    /// Period edge for weekly and coarser cadences.
    pub edge: BoundaryEdge,
}

impl Default for Anchor {
    fn default() -> Self {
        Self {
            hour: DEFAULT_ANCHOR_HOUR,
            edge: BoundaryEdge::Start,
        }
    }
}

/// Computes next-eligible refresh instants for one dataset.
#[derive(Clone, Copy, Debug)]
pub struct RefreshClock {
    min_start: NaiveDate,
    anchor: Anchor,
}

impl RefreshClock {
    /// Clock for a dataset whose history starts at `min_start`.
    pub fn new(min_start: NaiveDate, anchor: Anchor) -> Self {
        Self {
            min_start,
            anchor: Anchor {
                hour: anchor.hour.min(23),
                edge: anchor.edge,
            },
        }
    }

    /// First instant at which a refresh may run again.
    pub fn next_eligible(
        &self,
        last: Option<NaiveDateTime>,
        cadence: RefreshCadence,
    ) -> NaiveDateTime {
        let Some(last) = last else {
            return midnight(self.min_start);
        };
        let day = last.date();

        match cadence {
            RefreshCadence::Minutes(n) => {
                let time = NaiveTime::from_hms_opt(last.hour(), last.minute(), 0)
                    .unwrap_or(NaiveTime::MIN);
                day.and_time(time) + Duration::minutes(i64::from(n))
            }
            RefreshCadence::Hours(n) => {
                let time = NaiveTime::from_hms_opt(last.hour(), 0, 0).unwrap_or(NaiveTime::MIN);
                day.and_time(time) + Duration::hours(i64::from(n))
            }
            RefreshCadence::Daily => {
                let limit = self.at_anchor_hour(day);
                if last < limit {
                    limit
                } else {
                    self.at_anchor_hour(calendar::succ(day))
                }
            }
            RefreshCadence::BusinessDay => {
                if calendar::is_business_day(day) {
                    let limit = self.at_anchor_hour(day);
                    if last < limit {
                        return limit;
                    }
                }
                self.at_anchor_hour(calendar::next_business_day(day))
            }
            RefreshCadence::Weekly => {
                let next_start = calendar::shift_days(calendar::week_start(day), 7);
                midnight(match self.anchor.edge {
                    BoundaryEdge::Start => next_start,
                    BoundaryEdge::End => calendar::week_end(next_start),
                })
            }
            RefreshCadence::Monthly => {
                let next_start = calendar::add_months(day, 1);
                midnight(match self.anchor.edge {
                    BoundaryEdge::Start => next_start,
                    BoundaryEdge::End => calendar::month_end(next_start),
                })
            }
            RefreshCadence::Quarterly => {
                let q = calendar::quarter_of(day);
                let next_start = calendar::succ(calendar::quarter_end(day.year(), q));
                midnight(match self.anchor.edge {
                    BoundaryEdge::Start => next_start,
                    BoundaryEdge::End => {
                        calendar::quarter_end(next_start.year(), calendar::quarter_of(next_start))
                    }
                })
            }
            RefreshCadence::Yearly => {
                let next_year = day.year() + 1;
                midnight(match self.anchor.edge {
                    BoundaryEdge::Start => calendar::year_start(next_year),
                    BoundaryEdge::End => calendar::year_end(next_year),
                })
            }
        }
    }

    /// Whether a refresh last completed at `last` may run again at `now`.
    pub fn is_due(
        &self,
        last: Option<NaiveDateTime>,
        cadence: RefreshCadence,
        now: NaiveDateTime,
    ) -> bool {
        self.next_eligible(last, cadence) <= now
    }

    fn at_anchor_hour(&self, day: NaiveDate) -> NaiveDateTime {
        day.and_time(NaiveTime::from_hms_opt(self.anchor.hour, 0, 0).unwrap_or(NaiveTime::MIN))
    }
}

fn midnight(day: NaiveDate) -> NaiveDateTime {
    day.and_time(NaiveTime::MIN)
}
