//! Interfaces of the external services the stages call.
//!
//! Stages only see these traits. The driver constructs concrete clients once
//! per process and hands them in as a [`Collaborators`] bundle, so tests can
//! substitute in-process doubles.

use std::sync::Arc;

use async_trait::async_trait;
use solmem_memory::clock::{ClockError, SimulationClock};
use solmem_memory::content_store::FsContentStore;
use solmem_memory::vector_index::VectorIndex as SqliteVectorIndex;
use solmem_types::{CollaboratorError, EarthDate, EmbeddingRecord, Label, Photo, PipelineError};

/// Source of rover imagery.
#[async_trait]
pub trait ImagerySource: Send + Sync {
    /// Photos taken on `earth_date` (sol `sol`).
    async fn photos(&self, earth_date: EarthDate, sol: u32) -> Result<Vec<Photo>, CollaboratorError>;

    /// Raw image bytes of `photo`.
    async fn download(&self, photo: &Photo) -> Result<Vec<u8>, CollaboratorError>;
}

/// Image-labeling service.
#[async_trait]
pub trait LabelDetector: Send + Sync {
    async fn detect_labels(&self, image: &[u8]) -> Result<Vec<Label>, CollaboratorError>;
}

/// Text-generation service.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, CollaboratorError>;
}

/// Text-embedding service.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CollaboratorError>;
}

/// Blob store for generated artifacts.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store `bytes` under `key`, returning a locator for [`ContentStore::get`].
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String, CollaboratorError>;
    async fn get(&self, locator: &str) -> Result<Vec<u8>, CollaboratorError>;
}

/// Vector index receiving memory embeddings.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, record: EmbeddingRecord) -> Result<(), CollaboratorError>;
}

/// Durable per-simulation date that only moves by compare-and-set.
pub trait ClockStore: Send + Sync {
    /// Stored date, seeding the landing date on first reference.
    fn get_or_seed(&self, simulation_id: &str) -> Result<EarthDate, ClockError>;
    fn current(&self, simulation_id: &str) -> Result<EarthDate, ClockError>;
    /// Move to the next day if the stored date is still `expected`.
    fn advance(&self, simulation_id: &str, expected: EarthDate) -> Result<EarthDate, ClockError>;
}

/// Every collaborator a pipeline run needs.
#[derive(Clone)]
pub struct Collaborators {
    pub imagery: Arc<dyn ImagerySource>,
    pub labels: Arc<dyn LabelDetector>,
    pub text: Arc<dyn TextGenerator>,
    pub embedder: Arc<dyn Embedder>,
    pub content: Arc<dyn ContentStore>,
    pub index: Arc<dyn VectorIndex>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Local store adapters
// ─────────────────────────────────────────────────────────────────────────────

/// Classify a failed HTTP exchange with `service`.
///
/// Timeouts, connection failures, `429` and `5xx` are transient; everything
/// else (4xx, undecodable bodies) is permanent.
pub(crate) fn http_error(service: &str, err: reqwest::Error) -> CollaboratorError {
    let retryable_status = err.status().is_some_and(|s| {
        s.is_server_error() || s == reqwest::StatusCode::TOO_MANY_REQUESTS
    });
    if err.is_timeout() || err.is_connect() || retryable_status {
        CollaboratorError::transient(service, err.to_string())
    } else {
        CollaboratorError::permanent(service, err.to_string())
    }
}

fn into_collaborator(err: impl Into<PipelineError>, service: &str) -> CollaboratorError {
    match err.into() {
        PipelineError::Collaborator(c) => c,
        other => CollaboratorError::permanent(service, other.to_string()),
    }
}

impl ClockStore for SimulationClock {
    fn get_or_seed(&self, simulation_id: &str) -> Result<EarthDate, ClockError> {
        SimulationClock::get_or_seed(self, simulation_id)
    }

    fn current(&self, simulation_id: &str) -> Result<EarthDate, ClockError> {
        SimulationClock::current(self, simulation_id)
    }

    fn advance(&self, simulation_id: &str, expected: EarthDate) -> Result<EarthDate, ClockError> {
        SimulationClock::advance(self, simulation_id, expected)
    }
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String, CollaboratorError> {
        FsContentStore::put(self, key, &bytes).map_err(|e| into_collaborator(e, "content_store"))
    }

    async fn get(&self, locator: &str) -> Result<Vec<u8>, CollaboratorError> {
        FsContentStore::get(self, locator).map_err(|e| into_collaborator(e, "content_store"))
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert(&self, record: EmbeddingRecord) -> Result<(), CollaboratorError> {
        SqliteVectorIndex::upsert(self, &record).map_err(|e| into_collaborator(e, "vector_index"))
    }
}
