//! Local vector index for memory embeddings.
//!
//! Persists [`EmbeddingRecord`]s (vector plus metadata) to SQLite and ranks
//! them by cosine similarity against a query vector.
//!
//! # Storage layout
//!
//! | column     | type | description                                  |
//! |------------|------|----------------------------------------------|
//! | memory_id  | TEXT | Artifact id, primary key (upsert target)     |
//! | earth_date | TEXT | Artifact date, canonical `YYYY-MM-DD`        |
//! | metadata   | TEXT | JSON [`EmbeddingMetadata`]                   |
//! | embedding  | BLOB | Little-endian f32 vector (4 × N bytes)       |
//! | updated_at | TEXT | RFC-3339 time of the last upsert (UTC)       |
//!
//! # Example
//!
//! ```rust
//! use solmem_memory::vector_index::VectorIndex;
//! use solmem_types::{ArtifactKind, EmbeddingMetadata, EmbeddingRecord};
//!
//! let index = VectorIndex::open_in_memory().unwrap();
//! let record = EmbeddingRecord {
//!     memory_id: "image1_memory".into(),
//!     vector: vec![0.1, 0.9, 0.3],
//!     metadata: EmbeddingMetadata {
//!         date: "2024-01-08".parse().unwrap(),
//!         kind: ArtifactKind::Memory,
//!         content_ref: "content://memories/2024-01-08/image1_memory.txt".into(),
//!         photo_id: 1,
//!         text: "Layered rock under a pale sky.".into(),
//!     },
//! };
//! index.upsert(&record).unwrap();
//!
//! let hits = index.recall_similar(&[0.1, 0.9, 0.3], 5).unwrap();
//! assert_eq!(hits[0].0.memory_id, "image1_memory");
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use rusqlite::{Connection, params};
use solmem_types::{CollaboratorError, EmbeddingMetadata, EmbeddingRecord, PipelineError};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from vector index operations.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Embedding vectors must be non-empty")]
    EmptyVector,
}

impl From<IndexError> for PipelineError {
    fn from(err: IndexError) -> Self {
        PipelineError::Collaborator(CollaboratorError::permanent("vector_index", err.to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Embedding serialisation helpers
// ─────────────────────────────────────────────────────────────────────────────

fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Compute the cosine similarity between two equal-length vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` if either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// VectorIndex
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed vector index keyed by memory id.
pub struct VectorIndex {
    conn: Mutex<Connection>,
}

impl VectorIndex {
    /// Open (or create) a persistent SQLite database at `path`.
    pub fn open(path: &str) -> Result<Self, IndexError> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, IndexError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, IndexError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS memory_vectors (
                memory_id  TEXT NOT NULL PRIMARY KEY,
                earth_date TEXT NOT NULL,
                metadata   TEXT NOT NULL,
                embedding  BLOB NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace the vector stored under `record.memory_id`.
    pub fn upsert(&self, record: &EmbeddingRecord) -> Result<(), IndexError> {
        if record.vector.is_empty() {
            return Err(IndexError::EmptyVector);
        }
        let metadata = serde_json::to_string(&record.metadata)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO memory_vectors
                 (memory_id, earth_date, metadata, embedding, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.memory_id,
                record.metadata.date.to_string(),
                metadata,
                embedding_to_bytes(&record.vector),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn len(&self) -> Result<usize, IndexError> {
        let n: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM memory_vectors", [], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or_default())
    }

    pub fn is_empty(&self) -> Result<bool, IndexError> {
        Ok(self.len()? == 0)
    }

    /// Every stored record, ordered by earth date then id.
    pub fn all_records(&self) -> Result<Vec<EmbeddingRecord>, IndexError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT memory_id, metadata, embedding
             FROM memory_vectors
             ORDER BY earth_date ASC, memory_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let memory_id: String = row.get(0)?;
            let metadata: String = row.get(1)?;
            let blob: Vec<u8> = row.get(2)?;
            Ok((memory_id, metadata, blob))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (memory_id, metadata, blob) = row?;
            let metadata: EmbeddingMetadata = serde_json::from_str(&metadata)?;
            records.push(EmbeddingRecord {
                memory_id,
                vector: bytes_to_embedding(&blob),
                metadata,
            });
        }
        Ok(records)
    }

    /// Return the `top_k` records most similar to `query`, highest first.
    ///
    /// Records whose dimension differs from the query are skipped.
    pub fn recall_similar(
        &self,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<(EmbeddingRecord, f32)>, IndexError> {
        if query.is_empty() {
            return Err(IndexError::EmptyVector);
        }
        let mut scored: Vec<(EmbeddingRecord, f32)> = self
            .all_records()?
            .into_iter()
            .filter(|r| r.vector.len() == query.len())
            .map(|r| {
                let score = cosine_similarity(&r.vector, query);
                (r, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(top_k);
        Ok(scored)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
