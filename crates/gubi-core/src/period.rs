use crate::error::LedgerError;
use chrono::{DateTime, Datelike, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Calendar-month identifier rendered as `"{year}/{month}"` with an unpadded month, e.g. `2024/5`.
///
/// Used as the idempotence key for basic-income credits and as the batching key for
/// transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeriodToken {
    year: i32,
    month: u32,
}

impl PeriodToken {
    pub fn new(year: i32, month: u32) -> Result<Self, LedgerError> {
        if !(1..=12).contains(&month) {
            return Err(LedgerError::InvalidPeriod(format!("{year}/{month}")));
        }
        Ok(Self { year, month })
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }

    pub fn parse(value: &str) -> Result<Self, LedgerError> {
        let invalid = || LedgerError::InvalidPeriod(value.to_string());
        let (year, month) = value.trim().split_once('/').ok_or_else(invalid)?;
        let year = year.parse::<i32>().map_err(|_| invalid())?;
        let month = month.parse::<u32>().map_err(|_| invalid())?;
        Self::new(year, month).map_err(|_| invalid())
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Compare against a raw token as stored in `user_balance.last_received`.
    pub fn matches(&self, raw: &str) -> bool {
        Self::parse(raw).map(|other| other == *self).unwrap_or(false)
    }
}

impl fmt::Display for PeriodToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.year, self.month)
    }
}

impl FromStr for PeriodToken {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PeriodToken {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PeriodToken> for String {
    fn from(value: PeriodToken) -> Self {
        value.to_string()
    }
}

/// Subscription end date: one calendar month later, clamped to the end of shorter months.
pub fn one_month_after(start: DateTime<Utc>) -> DateTime<Utc> {
    start
        .checked_add_months(Months::new(1))
        .unwrap_or_else(|| start + Duration::days(31))
}
