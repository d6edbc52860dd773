//! Calendar months and the event that opens one.

use super::EventType;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors building a [`CalendarMonth`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalendarMonthError {
    /// Month number outside `1..=12`.
    #[error("Month must be between 1 and 12, got {0}")]
    MonthOutOfRange(u32),
}

#[derive(Deserialize)]
struct MonthParts {
    year: i32,
    month: u32,
}

/// A calendar month, e.g. `2024-03`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "MonthParts")]
pub struct CalendarMonth {
    year: i32,
    month: u32,
}

impl CalendarMonth {
    /// Builds a month, rejecting month numbers outside `1..=12`.
    pub const fn try_new(year: i32, month: u32) -> Result<Self, CalendarMonthError> {
        if month == 0 || month > 12 {
            return Err(CalendarMonthError::MonthOutOfRange(month));
        }
        Ok(Self { year, month })
    }

    /// The month containing `at`.
    pub fn of(at: &DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }

    /// The calendar year.
    pub const fn year(&self) -> i32 {
        self.year
    }

    /// The month number, `1..=12`.
    pub const fn month(&self) -> u32 {
        self.month
    }
}

impl TryFrom<MonthParts> for CalendarMonth {
    type Error = CalendarMonthError;

    fn try_from(parts: MonthParts) -> Result<Self, Self::Error> {
        Self::try_new(parts.year, parts.month)
    }
}

impl fmt::Display for CalendarMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.year, self.month)
    }
}

/// A new calendar month has begun.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthStarted {
    /// The month that started
    pub month: CalendarMonth,
}

impl EventType for MonthStarted {
    const EVENT_TYPE: &'static str = "month_started";
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    #[test]
    fn displays_zero_padded_month() {
        let month = CalendarMonth::try_new(2024, 3).unwrap();
        insta::assert_snapshot!(month.to_string(), @"2024-03");
    }

    #[test]
    fn derived_from_timestamp() {
        let at = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap();
        assert_eq!(
            CalendarMonth::of(&at),
            CalendarMonth::try_new(2023, 12).unwrap()
        );
    }

    #[test]
    fn rejects_month_out_of_range() {
        assert_eq!(
            CalendarMonth::try_new(2024, 13),
            Err(CalendarMonthError::MonthOutOfRange(13))
        );
        assert!(CalendarMonth::try_new(2024, 0).is_err());
    }

    #[test]
    fn deserialization_validates_month() {
        let bad: Result<CalendarMonth, _> = serde_json::from_str(r#"{"year":2024,"month":14}"#);
        assert!(bad.is_err());
        let good: CalendarMonth = serde_json::from_str(r#"{"year":2024,"month":2}"#).unwrap();
        assert_eq!(good.month(), 2);
    }

    proptest! {
        #[test]
        fn every_day_of_a_month_belongs_to_it(year in 1900i32..3000, month in 1u32..=12, day in 1u32..=28) {
            let at = Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).unwrap();
            prop_assert_eq!(CalendarMonth::of(&at), CalendarMonth::try_new(year, month).unwrap());
        }
    }
}
