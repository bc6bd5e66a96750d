use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Inclusive span of calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.start, self.end)
    }
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        if start <= end {
            DateRange { start, end }
        } else {
            DateRange { start: end, end: start }
        }
    }

    /// `date ± days`, the eligibility window around a receipt date.
    pub fn around(date: NaiveDate, days: i64) -> Self {
        DateRange::widened(date, date, days)
    }

    /// Smallest range covering every date, widened by `days` on both sides.
    pub fn spanning<I>(dates: I, days: i64) -> Option<Self>
    where
        I: IntoIterator<Item = NaiveDate>,
    {
        let mut iter = dates.into_iter();
        let first = iter.next()?;
        let (min, max) = iter.fold((first, first), |(lo, hi), d| (lo.min(d), hi.max(d)));
        Some(DateRange::widened(min, max, days))
    }

    /// `start - days ..= end + days`, saturating at the calendar limits.
    fn widened(start: NaiveDate, end: NaiveDate, days: i64) -> Self {
        let days = Duration::try_days(days.max(0)).unwrap_or(Duration::MAX);
        DateRange::new(
            start.checked_sub_signed(days).unwrap_or(NaiveDate::MIN),
            end.checked_add_signed(days).unwrap_or(NaiveDate::MAX),
        )
    }

    pub fn contains(self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

/// Whole days between two dates, regardless of order.
pub fn days_between(a: NaiveDate, b: NaiveDate) -> i64 {
    (a - b).num_days().abs()
}
