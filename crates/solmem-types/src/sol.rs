//! Sol Converter – earth date ↔ rover-day conversion.
//!
//! ```text
//! days_since_landing = (date - landing_date) + 1
//! sol                = round(days_since_landing / sol_length_in_days)
//! ```
//!
//! The landing day itself is sol 1. Dates before landing are rejected.
//!
//! ```rust
//! use solmem_types::{sol::earth_date_to_sol, EarthDate};
//!
//! let date: EarthDate = "2012-08-07".parse().unwrap();
//! assert_eq!(earth_date_to_sol(date).unwrap(), 2);
//! ```

use crate::date::EarthDate;
use crate::error::PipelineError;

/// Length of one Martian sol in Earth days.
pub const SOL_LENGTH_IN_DAYS: f64 = 1.027491252;

/// Curiosity's landing date, the epoch of every simulation.
pub fn landing_date() -> EarthDate {
    // 2012-08-06 is always representable.
    EarthDate::from_ymd(2012, 8, 6).unwrap_or_else(|| EarthDate::from_naive(Default::default()))
}

/// Convert `date` to a sol using the standard sol length.
///
/// # Errors
///
/// Returns [`PipelineError::Validation`] for dates before landing.
pub fn earth_date_to_sol(date: EarthDate) -> Result<u32, PipelineError> {
    SolConverter::default().earth_date_to_sol(date)
}

/// Converter with a configurable sol length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolConverter {
    landing: EarthDate,
    sol_length_in_days: f64,
}

impl Default for SolConverter {
    fn default() -> Self {
        Self {
            landing: landing_date(),
            sol_length_in_days: SOL_LENGTH_IN_DAYS,
        }
    }
}

impl SolConverter {
    /// # Errors
    ///
    /// Returns [`PipelineError::Configuration`] unless `sol_length_in_days`
    /// is finite and positive.
    pub fn new(sol_length_in_days: f64) -> Result<Self, PipelineError> {
        if !sol_length_in_days.is_finite() || sol_length_in_days <= 0.0 {
            return Err(PipelineError::Configuration(format!(
                "sol_length_in_days must be a positive number, got {sol_length_in_days}"
            )));
        }
        Ok(Self {
            landing: landing_date(),
            sol_length_in_days,
        })
    }

    pub fn landing(&self) -> EarthDate {
        self.landing
    }

    pub fn earth_date_to_sol(&self, date: EarthDate) -> Result<u32, PipelineError> {
        let elapsed = date.days_since(self.landing);
        if elapsed < 0 {
            return Err(PipelineError::Validation(format!(
                "earth date {date} is before landing on {}",
                self.landing
            )));
        }
        let days_since_landing = (elapsed + 1) as f64;
        let sol = (days_since_landing / self.sol_length_in_days).round();
        u32::try_from(sol as u64)
            .map_err(|_| PipelineError::Validation(format!("sol for {date} does not fit in u32")))
    }
}
