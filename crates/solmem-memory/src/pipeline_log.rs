//! Pipeline Log – the per-date ledger of stage outcomes.
//!
//! Every stage writes its own nested record into the row for the earth date
//! it worked on. A write merges exactly one stage column and never touches
//! another stage's record, so stages may record in any order (or be retried)
//! and the row converges to the same content.
//!
//! # Storage layout
//!
//! | column     | type    | description                                         |
//! |------------|---------|-----------------------------------------------------|
//! | earth_date | TEXT    | Primary key, canonical `YYYY-MM-DD`                 |
//! | sol        | INTEGER | Set by the first write that supplies it             |
//! | updated_at | TEXT    | RFC-3339 time of the latest write to the row (UTC)  |
//! | schedule   | TEXT    | JSON `{status, output, updated_at}` or NULL         |
//! | fetch      | TEXT    | "                                                   |
//! | generate   | TEXT    | "                                                   |
//! | embed      | TEXT    | "                                                   |
//!
//! Stage columns are named by [`StageId::key`], a closed set; nothing derived
//! from caller text is ever spliced into SQL.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use solmem_types::{CollaboratorError, EarthDate, PipelineError, StageId, StageStatus};
use thiserror::Error;
use tracing::debug;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from pipeline log operations.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("No pipeline log entry for {0}")]
    NotFound(EarthDate),
    #[error("Corrupt pipeline log row: {0}")]
    Corrupt(String),
}

impl From<LedgerError> for PipelineError {
    fn from(err: LedgerError) -> Self {
        PipelineError::Collaborator(CollaboratorError::permanent("pipeline_log", err.to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row types
// ─────────────────────────────────────────────────────────────────────────────

/// One stage's nested record inside a ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub status: StageStatus,
    pub output: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// A full ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineLogEntry {
    pub earth_date: EarthDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sol: Option<u32>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<StageRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch: Option<StageRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generate: Option<StageRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embed: Option<StageRecord>,
}

impl PipelineLogEntry {
    pub fn stage(&self, id: StageId) -> Option<&StageRecord> {
        match id {
            StageId::Schedule => self.schedule.as_ref(),
            StageId::Fetch => self.fetch.as_ref(),
            StageId::Generate => self.generate.as_ref(),
            StageId::Embed => self.embed.as_ref(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PipelineLog
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed, merge-on-write stage ledger.
pub struct PipelineLog {
    conn: Mutex<Connection>,
}

const SELECT_COLUMNS: &str = "earth_date, sol, updated_at, schedule, fetch, generate, embed";

impl PipelineLog {
    /// Open (or create) a persistent SQLite database at `path`.
    pub fn open(path: &str) -> Result<Self, LedgerError> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS pipeline_log (
                earth_date TEXT NOT NULL PRIMARY KEY,
                sol        INTEGER,
                updated_at TEXT NOT NULL,
                schedule   TEXT,
                fetch      TEXT,
                generate   TEXT,
                embed      TEXT
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge `stage`'s outcome into the row for `earth_date`.
    ///
    /// Creates the row on first write, refreshes the row's `updated_at`, and
    /// sets `sol` only if the row does not have one yet. Other stages'
    /// records are left untouched.
    pub fn record(
        &self,
        earth_date: EarthDate,
        stage: StageId,
        status: StageStatus,
        output: &serde_json::Value,
        sol: Option<u32>,
    ) -> Result<(), LedgerError> {
        let now = Utc::now();
        let record = StageRecord {
            status,
            output: output.clone(),
            updated_at: now,
        };
        let record_json = serde_json::to_string(&record)?;
        let column = stage.key();
        let sql = format!(
            "INSERT INTO pipeline_log (earth_date, sol, updated_at, {column})
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(earth_date) DO UPDATE SET
                 {column}   = excluded.{column},
                 updated_at = excluded.updated_at,
                 sol        = COALESCE(pipeline_log.sol, excluded.sol)"
        );
        self.conn().execute(
            &sql,
            params![earth_date.to_string(), sol, now.to_rfc3339(), record_json],
        )?;
        debug!(%earth_date, stage = %stage, status = status.as_str(), "pipeline log updated");
        Ok(())
    }

    /// Read the row for `earth_date`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] when no stage has recorded for that date.
    pub fn read(&self, earth_date: EarthDate) -> Result<PipelineLogEntry, LedgerError> {
        let conn = self.conn();
        let sql = format!("SELECT {SELECT_COLUMNS} FROM pipeline_log WHERE earth_date = ?1");
        let raw = conn
            .query_row(&sql, params![earth_date.to_string()], RawRow::from_row)
            .optional()?;
        raw.ok_or(LedgerError::NotFound(earth_date))?.into_entry()
    }

    /// Rows for the latest `limit` earth dates, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<PipelineLogEntry>, LedgerError> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM pipeline_log ORDER BY earth_date DESC LIMIT ?1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], RawRow::from_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }
        Ok(entries)
    }
}

struct RawRow {
    earth_date: String,
    sol: Option<u32>,
    updated_at: String,
    stages: [Option<String>; 4],
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            earth_date: row.get(0)?,
            sol: row.get(1)?,
            updated_at: row.get(2)?,
            stages: [row.get(3)?, row.get(4)?, row.get(5)?, row.get(6)?],
        })
    }

    fn into_entry(self) -> Result<PipelineLogEntry, LedgerError> {
        let earth_date = self
            .earth_date
            .parse::<EarthDate>()
            .map_err(|e| LedgerError::Corrupt(e.to_string()))?;
        let updated_at = self
            .updated_at
            .parse::<DateTime<Utc>>()
            .map_err(|e| LedgerError::Corrupt(format!("{earth_date}: {e}")))?;
        let [schedule, fetch, generate, embed] = self.stages.map(|raw| {
            raw.map(|json| serde_json::from_str::<StageRecord>(&json))
                .transpose()
        });
        Ok(PipelineLogEntry {
            earth_date,
            sol: self.sol,
            updated_at,
            schedule: schedule?,
            fetch: fetch?,
            generate: generate?,
            embed: embed?,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
