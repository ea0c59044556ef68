//! The stage contract shared by Schedule, Fetch, Generate and Embed.
//!
//! A stage's externally observable result is a [`StageResponse`]:
//! `{"statusCode": 200, "body": <payload>}` on success and
//! `{"statusCode": 500, "body": {"error": "<message>"}}` on failure. The body
//! is always a structured value; stages hand each other the typed payload and
//! never re-parse a string.
//!
//! Stages that fan out per photo return a [`BatchOutcome`]. When every item
//! succeeds it serialises as a plain array, otherwise as
//! `{"succeeded": [...], "failed": [{"photo_id", "error"}]}`.

use std::fmt;
use std::str::FromStr;

use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::PipelineError;

pub const STATUS_OK: u16 = 200;
pub const STATUS_ERROR: u16 = 500;

// ─────────────────────────────────────────────────────────────────────────────
// StageId
// ─────────────────────────────────────────────────────────────────────────────

/// The fixed set of pipeline stages.
///
/// Each variant maps to exactly one ledger key via [`StageId::key`]; keys are
/// never derived from free-text labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageId {
    Schedule,
    Fetch,
    Generate,
    Embed,
}

impl StageId {
    /// All stages in execution order.
    pub const ALL: [StageId; 4] = [
        StageId::Schedule,
        StageId::Fetch,
        StageId::Generate,
        StageId::Embed,
    ];

    /// Storage key of this stage's nested record in a pipeline log row.
    pub const fn key(self) -> &'static str {
        match self {
            StageId::Schedule => "schedule",
            StageId::Fetch => "fetch",
            StageId::Generate => "generate",
            StageId::Embed => "embed",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for StageId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageId::ALL
            .into_iter()
            .find(|id| id.key().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PipelineError::Validation(format!("unknown stage {s:?}")))
    }
}

/// Outcome recorded for a stage in the pipeline log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Success,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Success => "SUCCESS",
            StageStatus::Failed => "FAILED",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// StageResponse
// ─────────────────────────────────────────────────────────────────────────────

/// Body of a [`StageResponse`]: either the stage payload or an error message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseBody<T> {
    Error { error: String },
    Ok(T),
}

/// `{statusCode, body}` as seen by the workflow driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResponse<T> {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: ResponseBody<T>,
}

impl<T> StageResponse<T> {
    pub fn ok(body: T) -> Self {
        Self {
            status_code: STATUS_OK,
            body: ResponseBody::Ok(body),
        }
    }

    pub fn failure(error: &PipelineError) -> Self {
        Self {
            status_code: STATUS_ERROR,
            body: ResponseBody::Error {
                error: error.to_string(),
            },
        }
    }

    pub fn from_result(result: Result<T, PipelineError>) -> Self {
        match result {
            Ok(body) => Self::ok(body),
            Err(e) => Self::failure(&e),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == STATUS_OK && matches!(self.body, ResponseBody::Ok(_))
    }

    /// Unwrap an upstream stage's response for use as this stage's input.
    ///
    /// # Errors
    ///
    /// A failed upstream response is a [`PipelineError::Validation`]: the
    /// downstream stage has nothing valid to work on.
    pub fn into_result(self) -> Result<T, PipelineError> {
        match (self.status_code, self.body) {
            (STATUS_OK, ResponseBody::Ok(body)) => Ok(body),
            (code, ResponseBody::Error { error }) => Err(PipelineError::Validation(format!(
                "upstream stage failed with status {code}: {error}"
            ))),
            (code, ResponseBody::Ok(_)) => Err(PipelineError::Validation(format!(
                "upstream stage returned status {code}"
            ))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-item fan-out results
// ─────────────────────────────────────────────────────────────────────────────

/// One item that failed inside a fan-out stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub photo_id: u64,
    pub error: String,
}

/// Successful subset plus per-item failures of a fan-out stage.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome<T> {
    pub succeeded: Vec<T>,
    pub failed: Vec<ItemFailure>,
}

impl<T> Default for BatchOutcome<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<T> BatchOutcome<T> {
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

impl<T: Serialize> Serialize for BatchOutcome<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.failed.is_empty() {
            return self.succeeded.serialize(serializer);
        }
        let mut st = serializer.serialize_struct("BatchOutcome", 2)?;
        st.serialize_field("succeeded", &self.succeeded)?;
        st.serialize_field("failed", &self.failed)?;
        st.end()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BatchRepr<T> {
    Complete(Vec<T>),
    Partial {
        succeeded: Vec<T>,
        #[serde(default)]
        failed: Vec<ItemFailure>,
    },
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for BatchOutcome<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match BatchRepr::deserialize(deserializer)? {
            BatchRepr::Complete(succeeded) => BatchOutcome {
                succeeded,
                failed: Vec::new(),
            },
            BatchRepr::Partial { succeeded, failed } => BatchOutcome { succeeded, failed },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stage_keys_are_distinct() {
        let mut keys: Vec<_> = StageId::ALL.iter().map(|s| s.key()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), StageId::ALL.len());
    }

    #[test]
    fn stage_id_parses_from_key() {
        assert_eq!("fetch".parse::<StageId>().unwrap(), StageId::Fetch);
        assert_eq!("Embed".parse::<StageId>().unwrap(), StageId::Embed);
        assert!(matches!(
            "Lambda0: Daily Scheduler".parse::<StageId>(),
            Err(PipelineError::Validation(_))
        ));
    }

    #[test]
    fn response_wire_shape() {
        let ok = StageResponse::ok(vec![1, 2]);
        assert_eq!(serde_json::to_value(&ok).unwrap(), json!({"statusCode": 200, "body": [1, 2]}));

        let err: StageResponse<Vec<u8>> =
            StageResponse::failure(&PipelineError::Validation("missing earth_date".into()));
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["statusCode"], 500);
        assert!(v["body"]["error"].as_str().unwrap().contains("missing earth_date"));
    }

    #[test]
    fn failed_upstream_becomes_validation_error() {
        let err: StageResponse<Vec<u8>> =
            StageResponse::failure(&PipelineError::Validation("boom".into()));
        let back: StageResponse<Vec<u8>> =
            serde_json::from_value(serde_json::to_value(&err).unwrap()).unwrap();
        assert!(!back.is_success());
        assert!(matches!(back.into_result(), Err(PipelineError::Validation(_))));
    }

    #[test]
    fn complete_batch_serializes_as_array() {
        let batch = BatchOutcome {
            succeeded: vec!["a".to_string()],
            failed: vec![],
        };
        assert_eq!(serde_json::to_value(&batch).unwrap(), json!(["a"]));
        let empty: BatchOutcome<String> = BatchOutcome::default();
        assert_eq!(serde_json::to_value(&empty).unwrap(), json!([]));
    }

    #[test]
    fn partial_batch_serializes_with_failures() {
        let batch = BatchOutcome {
            succeeded: vec!["a".to_string()],
            failed: vec![ItemFailure {
                photo_id: 7,
                error: "label_detector: timed out".into(),
            }],
        };
        let v = serde_json::to_value(&batch).unwrap();
        assert_eq!(v["succeeded"], json!(["a"]));
        assert_eq!(v["failed"][0]["photo_id"], 7);

        let back: BatchOutcome<String> = serde_json::from_value(v).unwrap();
        assert_eq!(back, batch);
        let back: BatchOutcome<String> = serde_json::from_value(json!([])).unwrap();
        assert!(back.is_empty());
    }
}
