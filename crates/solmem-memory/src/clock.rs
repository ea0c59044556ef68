//! Simulation Clock.
//!
//! Holds the current earth date of every simulation and advances it one day
//! per scheduling tick.
//!
//! # Storage layout
//!
//! A single table `simulations` is created (if it does not already exist):
//!
//! | column        | type | description                                  |
//! |---------------|------|----------------------------------------------|
//! | simulation_id | TEXT | Primary key                                  |
//! | earth_date    | TEXT | Current date, canonical `YYYY-MM-DD`         |
//! | updated_at    | TEXT | RFC-3339 time of the last seed/advance (UTC) |
//!
//! # Concurrency
//!
//! [`SimulationClock::advance`] is a compare-and-set: the row is updated only
//! while it still holds the caller's `expected` date. A second writer (or a
//! retry of a call that already committed) loses the race with
//! [`ClockError::Stale`] instead of double-incrementing.
//!
//! # Example
//!
//! ```rust
//! use solmem_memory::clock::SimulationClock;
//!
//! let clock = SimulationClock::open_in_memory().unwrap();
//! let today = clock.get_or_seed("sim1").unwrap();
//! assert_eq!(today.to_string(), "2012-08-06");
//!
//! let tomorrow = clock.advance("sim1", today).unwrap();
//! assert_eq!(tomorrow.to_string(), "2012-08-07");
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use solmem_types::{CollaboratorError, DRY_RUN_SIMULATION_ID, EarthDate, PipelineError, landing_date};
use thiserror::Error;
use tracing::{debug, info};

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from clock operations.
#[derive(Error, Debug)]
pub enum ClockError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Simulation not found: {0}")]
    NotFound(String),
    #[error("Stored date for simulation '{simulation_id}' is no longer {expected}")]
    Stale {
        simulation_id: String,
        expected: EarthDate,
    },
    #[error("Corrupt clock row: {0}")]
    Corrupt(String),
}

impl From<ClockError> for PipelineError {
    fn from(err: ClockError) -> Self {
        match err {
            ClockError::Stale {
                simulation_id,
                expected,
            } => PipelineError::StaleClock {
                simulation_id,
                expected,
            },
            other => PipelineError::Collaborator(CollaboratorError::permanent(
                "clock_store",
                other.to_string(),
            )),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SimulationClock
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed per-simulation date store.
pub struct SimulationClock {
    conn: Mutex<Connection>,
}

impl SimulationClock {
    /// Open (or create) a persistent SQLite database at `path`.
    pub fn open(path: &str) -> Result<Self, ClockError> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, ClockError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, ClockError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS simulations (
                simulation_id TEXT NOT NULL PRIMARY KEY,
                earth_date    TEXT NOT NULL,
                updated_at    TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the stored date for `simulation_id`, seeding it with the
    /// landing date on first reference.
    ///
    /// Seeding is an `INSERT OR IGNORE`, so two callers racing on a brand-new
    /// id both observe the same seeded row.
    pub fn get_or_seed(&self, simulation_id: &str) -> Result<EarthDate, ClockError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        let seeded = conn.execute(
            "INSERT OR IGNORE INTO simulations (simulation_id, earth_date, updated_at)
             VALUES (?1, ?2, ?3)",
            params![simulation_id, landing_date().to_string(), now],
        )?;
        if seeded > 0 {
            info!(simulation_id, earth_date = %landing_date(), "seeded new simulation");
        }
        read_date(&conn, simulation_id)?.ok_or_else(|| ClockError::NotFound(simulation_id.to_string()))
    }

    /// Return the stored date without seeding.
    pub fn current(&self, simulation_id: &str) -> Result<EarthDate, ClockError> {
        read_date(&self.conn(), simulation_id)?
            .ok_or_else(|| ClockError::NotFound(simulation_id.to_string()))
    }

    /// Move `simulation_id` from `expected_current` to the following day.
    ///
    /// The reserved [`DRY_RUN_SIMULATION_ID`] never advances: its call
    /// returns `expected_current` and touches nothing.
    ///
    /// # Errors
    ///
    /// [`ClockError::Stale`] when the stored date is not `expected_current`
    /// (or the simulation does not exist).
    pub fn advance(
        &self,
        simulation_id: &str,
        expected_current: EarthDate,
    ) -> Result<EarthDate, ClockError> {
        if simulation_id == DRY_RUN_SIMULATION_ID {
            debug!(simulation_id, earth_date = %expected_current, "dry-run simulation; clock not advanced");
            return Ok(expected_current);
        }
        let next = expected_current
            .next_day()
            .map_err(|e| ClockError::Corrupt(e.to_string()))?;
        let updated = self.conn().execute(
            "UPDATE simulations SET earth_date = ?1, updated_at = ?2
             WHERE simulation_id = ?3 AND earth_date = ?4",
            params![
                next.to_string(),
                Utc::now().to_rfc3339(),
                simulation_id,
                expected_current.to_string(),
            ],
        )?;
        if updated == 0 {
            return Err(ClockError::Stale {
                simulation_id: simulation_id.to_string(),
                expected: expected_current,
            });
        }
        info!(simulation_id, from = %expected_current, to = %next, "advanced simulation clock");
        Ok(next)
    }
}

fn read_date(conn: &Connection, simulation_id: &str) -> Result<Option<EarthDate>, ClockError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT earth_date FROM simulations WHERE simulation_id = ?1",
            params![simulation_id],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|s| {
        s.parse::<EarthDate>()
            .map_err(|e| ClockError::Corrupt(format!("{simulation_id}: {e}")))
    })
    .transpose()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn make_clock() -> SimulationClock {
        SimulationClock::open_in_memory().unwrap()
    }

    fn d(s: &str) -> EarthDate {
        s.parse().unwrap()
    }

    #[test]
    fn unknown_simulation_is_seeded_with_landing_date() {
        let clock = make_clock();
        assert_eq!(clock.get_or_seed("sim1").unwrap(), d("2012-08-06"));
        assert_eq!(clock.current("sim1").unwrap(), d("2012-08-06"));
    }

    #[test]
    fn seeding_twice_has_no_side_effect() {
        let clock = make_clock();
        let first = clock.get_or_seed("sim1").unwrap();
        clock.advance("sim1", first).unwrap();
        assert_eq!(clock.get_or_seed("sim1").unwrap(), d("2012-08-07"));
    }

    #[test]
    fn advance_once_moves_one_day() {
        let clock = make_clock();
        let today = clock.get_or_seed("sim1").unwrap();
        assert_eq!(clock.advance("sim1", today).unwrap(), d("2012-08-07"));
        assert_eq!(clock.current("sim1").unwrap(), d("2012-08-07"));
    }

    #[test]
    fn retried_advance_after_commit_is_stale_not_double_increment() {
        let clock = make_clock();
        let today = clock.get_or_seed("sim1").unwrap();
        clock.advance("sim1", today).unwrap();
        let err = clock.advance("sim1", today).unwrap_err();
        assert!(matches!(err, ClockError::Stale { .. }));
        assert_eq!(clock.current("sim1").unwrap(), d("2012-08-07"));
    }

    #[test]
    fn dry_run_simulation_never_advances() {
        let clock = make_clock();
        let today = clock.get_or_seed(DRY_RUN_SIMULATION_ID).unwrap();
        for _ in 0..50 {
            assert_eq!(clock.advance(DRY_RUN_SIMULATION_ID, today).unwrap(), today);
        }
        assert_eq!(clock.current(DRY_RUN_SIMULATION_ID).unwrap(), today);
    }

    #[test]
    fn advancing_unknown_simulation_is_stale() {
        let clock = make_clock();
        let err = clock.advance("ghost", d("2012-08-06")).unwrap_err();
        assert!(matches!(err, ClockError::Stale { .. }));
    }

    #[test]
    fn simulations_are_independent() {
        let clock = make_clock();
        let a = clock.get_or_seed("a").unwrap();
        clock.get_or_seed("b").unwrap();
        clock.advance("a", a).unwrap();
        assert_eq!(clock.current("a").unwrap(), d("2012-08-07"));
        assert_eq!(clock.current("b").unwrap(), d("2012-08-06"));
    }

    #[test]
    fn stale_maps_to_pipeline_stale_clock() {
        let err: PipelineError = ClockError::Stale {
            simulation_id: "sim1".into(),
            expected: d("2012-08-06"),
        }
        .into();
        assert!(matches!(err, PipelineError::StaleClock { .. }));
        let err: PipelineError = ClockError::NotFound("x".into()).into();
        assert!(matches!(err, PipelineError::Collaborator(_)));
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("solmem.db");
        let path = path.to_string_lossy();
        {
            let clock = SimulationClock::open(&path).unwrap();
            let today = clock.get_or_seed("sim1").unwrap();
            clock.advance("sim1", today).unwrap();
        }
        let clock = SimulationClock::open(&path).unwrap();
        assert_eq!(clock.current("sim1").unwrap(), d("2012-08-07"));
    }
}
