use std::fmt;

use chrono::{Datelike, NaiveDate};

/// A calendar month, the unit the CRM report endpoint is queried by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonthPartition {
    pub year: i32,
    pub month: u32,
}

impl MonthPartition {
    pub fn new(year: i32, month: u32) -> Self {
        Self { year, month }
    }

    pub fn of(date: NaiveDate) -> Self {
        Self::new(date.year(), date.month())
    }

    /// The following month, rolling December over to January of the next year.
    pub fn next(self) -> Self {
        if self.month >= 12 {
            Self::new(self.year + 1, 1)
        } else {
            Self::new(self.year, self.month + 1)
        }
    }
}

impl fmt::Display for MonthPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}/{}", self.month, self.year)
    }
}

/// Every month from `start` through the month of `today`, inclusive, ascending.
///
/// A start after the current month yields an empty list.
pub fn months_to_fetch(start: MonthPartition, today: NaiveDate) -> Vec<MonthPartition> {
    let current = MonthPartition::of(today);
    let mut months = Vec::new();
    let mut month = start;

    while month <= current {
        months.push(month);
        month = month.next();
    }

    months
}
