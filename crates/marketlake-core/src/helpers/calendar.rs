//! Calendar arithmetic on naive dates.
//!
//! Weeks start on Monday. Business days are Monday through Friday; exchange
//! holidays are not modelled, a closed market simply yields no rows from the
//! source. All helpers saturate at the edges of the representable date range
//! instead of failing.

use chrono::{Datelike, Days, NaiveDate, Weekday};

fn ymd(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or(if year < 0 {
        NaiveDate::MIN
    } else {
        NaiveDate::MAX
    })
}

/// The day after `d`, saturating at [`NaiveDate::MAX`].
pub fn succ(d: NaiveDate) -> NaiveDate {
    d.succ_opt().unwrap_or(NaiveDate::MAX)
}

/// The day before `d`, saturating at [`NaiveDate::MIN`].
pub fn pred(d: NaiveDate) -> NaiveDate {
    d.pred_opt().unwrap_or(NaiveDate::MIN)
}

/// `d` shifted by a signed number of days, saturating at the range edges.
pub fn shift_days(d: NaiveDate, days: i64) -> NaiveDate {
    if days >= 0 {
        d.checked_add_days(Days::new(days.unsigned_abs()))
            .unwrap_or(NaiveDate::MAX)
    } else {
        d.checked_sub_days(Days::new(days.unsigned_abs()))
            .unwrap_or(NaiveDate::MIN)
    }
}

/// Monday through Friday.
pub fn is_business_day(d: NaiveDate) -> bool {
    !matches!(d.weekday(), Weekday::Sat | Weekday::Sun)
}

/// First business day strictly after `d`.
pub fn next_business_day(d: NaiveDate) -> NaiveDate {
    let mut next = succ(d);
    while !is_business_day(next) && next < NaiveDate::MAX {
        next = succ(next);
    }
    next
}

/// Monday of the week containing `d`.
pub fn week_start(d: NaiveDate) -> NaiveDate {
    shift_days(d, -i64::from(d.weekday().num_days_from_monday()))
}

/// Sunday of the week containing `d`.
pub fn week_end(d: NaiveDate) -> NaiveDate {
    shift_days(week_start(d), 6)
}

/// First day of the month containing `d`.
pub fn month_start(d: NaiveDate) -> NaiveDate {
    ymd(d.year(), d.month(), 1)
}

/// Last day of the month containing `d`.
pub fn month_end(d: NaiveDate) -> NaiveDate {
    pred(add_months(month_start(d), 1))
}

/// First day of the month `months` months after the month of `d`.
pub fn add_months(d: NaiveDate, months: i32) -> NaiveDate {
    let index = d.year() * 12 + d.month0() as i32 + months;
    ymd(index.div_euclid(12), index.rem_euclid(12) as u32 + 1, 1)
}

/// Quarter number (1..=4) of `d`.
pub fn quarter_of(d: NaiveDate) -> u32 {
    d.month0() / 3 + 1
}

/// First day of quarter `quarter` (1..=4) of `year`.
pub fn quarter_start(year: i32, quarter: u32) -> NaiveDate {
    ymd(year, (quarter.clamp(1, 4) - 1) * 3 + 1, 1)
}

/// Last day of quarter `quarter` (1..=4) of `year`.
pub fn quarter_end(year: i32, quarter: u32) -> NaiveDate {
    pred(add_months(quarter_start(year, quarter), 3))
}

/// January 1st of `year`.
pub fn year_start(year: i32) -> NaiveDate {
    ymd(year, 1, 1)
}

/// December 31st of `year`.
pub fn year_end(year: i32) -> NaiveDate {
    ymd(year, 12, 31)
}

/// Whether `d` is the last day of its quarter.
pub fn is_quarter_end(d: NaiveDate) -> bool {
    d == quarter_end(d.year(), quarter_of(d))
}

/// Step back `periods` quarter ends from `d`.
///
/// When `d` is not itself a quarter end, rolling back to the previous
/// quarter end counts as the first step, so `2020-05-15` stepped back twice
/// lands on `2019-12-31`, the same as `2020-06-30` stepped back twice.
pub fn quarter_end_back(d: NaiveDate, periods: u32) -> NaiveDate {
    let anchor = if is_quarter_end(d) {
        d
    } else {
        quarter_end(d.year(), quarter_of(d))
    };
    pred(add_months(succ(anchor), -3 * periods as i32))
}

/// Step back `periods` year starts from `d`.
///
/// When `d` is not January 1st, rolling back to the start of its own year
/// counts as the first step, so `2020-05-15` stepped back twice lands on
/// `2019-01-01`.
pub fn year_begin_back(d: NaiveDate, periods: u32) -> NaiveDate {
    let anchor_year = if d.ordinal() == 1 {
        d.year()
    } else {
        d.year() + 1
    };
    year_start(anchor_year - periods as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn business_days_skip_weekends() {
        // 2020-06-05 is a Friday.
        assert!(is_business_day(date(2020, 6, 5)));
        assert!(!is_business_day(date(2020, 6, 6)));
        assert_eq!(next_business_day(date(2020, 6, 5)), date(2020, 6, 8));
        assert_eq!(next_business_day(date(2020, 6, 6)), date(2020, 6, 8));
        assert_eq!(next_business_day(date(2020, 6, 8)), date(2020, 6, 9));
    }

    #[test]
    fn week_bounds_are_monday_to_sunday() {
        assert_eq!(week_start(date(2020, 6, 3)), date(2020, 6, 1));
        assert_eq!(week_end(date(2020, 6, 3)), date(2020, 6, 7));
        assert_eq!(week_start(date(2020, 6, 7)), date(2020, 6, 1));
    }

    #[test]
    fn month_and_quarter_bounds() {
        assert_eq!(month_end(date(2020, 2, 10)), date(2020, 2, 29));
        assert_eq!(month_end(date(2020, 12, 10)), date(2020, 12, 31));
        assert_eq!(add_months(date(2020, 11, 1), 3), date(2021, 2, 1));
        assert_eq!(add_months(date(2020, 1, 1), -1), date(2019, 12, 1));
        assert_eq!(quarter_of(date(2020, 8, 1)), 3);
        assert_eq!(quarter_start(2020, 3), date(2020, 7, 1));
        assert_eq!(quarter_end(2020, 4), date(2020, 12, 31));
    }

    #[test]
    fn quarter_end_back_counts_rollback_as_a_step() {
        assert_eq!(quarter_end_back(date(2020, 6, 30), 2), date(2019, 12, 31));
        assert_eq!(quarter_end_back(date(2020, 5, 15), 2), date(2019, 12, 31));
        assert_eq!(quarter_end_back(date(2020, 1, 1), 2), date(2019, 9, 30));
    }

    #[test]
    fn year_begin_back_counts_rollback_as_a_step() {
        assert_eq!(year_begin_back(date(2020, 5, 15), 2), date(2019, 1, 1));
        assert_eq!(year_begin_back(date(2020, 1, 1), 2), date(2018, 1, 1));
        assert_eq!(year_begin_back(date(2020, 12, 31), 2), date(2019, 1, 1));
    }
}
