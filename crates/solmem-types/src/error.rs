//! The pipeline error taxonomy.
//!
//! | kind | retry? | ledger entry |
//! |---|---|---|
//! | [`PipelineError::Configuration`] | never | never (raised before any store is touched) |
//! | [`PipelineError::Validation`] | never | only when the earth date is already known |
//! | [`PipelineError::Collaborator`] | per driver policy | always for the failing stage |
//! | [`PipelineError::StaleClock`] | once, by the scheduler | surfaces as a collaborator error |

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::date::EarthDate;

// ─────────────────────────────────────────────────────────────────────────────
// CollaboratorError
// ─────────────────────────────────────────────────────────────────────────────

/// A call to an external service (imagery API, label detector, text
/// generator, content store, vector index, durable stores) failed.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{service}: {message}")]
pub struct CollaboratorError {
    /// Short service label, e.g. `"imagery"` or `"vector_index"`.
    pub service: String,
    pub message: String,
    /// `true` when a bounded retry at the call boundary may succeed
    /// (timeouts, connection resets, 429/5xx responses).
    pub transient: bool,
}

impl CollaboratorError {
    pub fn transient(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            message: message.into(),
            transient: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PipelineError
// ─────────────────────────────────────────────────────────────────────────────

/// Every failure a stage or the orchestrator can report to the driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("stale clock for simulation '{simulation_id}': stored date no longer {expected}")]
    StaleClock {
        simulation_id: String,
        expected: EarthDate,
    },
}

impl PipelineError {
    /// `true` when the driver may retry the whole stage under its own policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Collaborator(_) | PipelineError::StaleClock { .. }
        )
    }

    /// Attach the earth date the failure belongs to.
    pub fn at(self, earth_date: EarthDate) -> StageFailure {
        StageFailure {
            earth_date: Some(earth_date),
            error: self,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// StageFailure
// ─────────────────────────────────────────────────────────────────────────────

/// A [`PipelineError`] plus the earth date it happened on, when known.
///
/// The orchestrator writes a `Failed` ledger entry only when `earth_date` is
/// `Some`; a schedule that fails before reading the clock has no row to
/// write to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub earth_date: Option<EarthDate>,
    pub error: PipelineError,
}

impl From<PipelineError> for StageFailure {
    fn from(error: PipelineError) -> Self {
        Self {
            earth_date: None,
            error,
        }
    }
}

impl From<CollaboratorError> for StageFailure {
    fn from(error: CollaboratorError) -> Self {
        PipelineError::from(error).into()
    }
}
