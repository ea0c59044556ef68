//! [`EarthDate`] – a Gregorian calendar date in canonical `YYYY-MM-DD` form.
//!
//! Every date that crosses a store or stage boundary goes through this type,
//! so a non-canonical string (`"2012-8-6"`, `"2012/08/06"`, `"yesterday"`) is
//! rejected with [`PipelineError::Validation`] at the edge instead of being
//! written to a ledger key.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::PipelineError;

const FORMAT: &str = "%Y-%m-%d";

/// A calendar date on Earth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EarthDate(NaiveDate);

impl EarthDate {
    /// Build a date from year/month/day, returning `None` for impossible dates.
    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Self)
    }

    pub fn from_naive(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn as_naive(&self) -> NaiveDate {
        self.0
    }

    /// The following calendar day.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Validation`] at the end of chrono's
    /// representable range.
    pub fn next_day(self) -> Result<Self, PipelineError> {
        self.0
            .succ_opt()
            .map(Self)
            .ok_or_else(|| PipelineError::Validation(format!("no calendar day after {self}")))
    }

    /// Signed number of days from `earlier` to `self`.
    pub fn days_since(self, earlier: EarthDate) -> i64 {
        (self.0 - earlier.0).num_days()
    }
}

impl fmt::Display for EarthDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(FORMAT))
    }
}

impl FromStr for EarthDate {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let date = NaiveDate::parse_from_str(trimmed, FORMAT)
            .map_err(|e| PipelineError::Validation(format!("invalid earth date {s:?}: {e}")))?;
        let parsed = Self(date);
        // chrono accepts unpadded fields; the ledger key must be canonical.
        if parsed.to_string() != trimmed {
            return Err(PipelineError::Validation(format!(
                "earth date {s:?} is not in canonical YYYY-MM-DD form"
            )));
        }
        Ok(parsed)
    }
}

impl Serialize for EarthDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EarthDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
