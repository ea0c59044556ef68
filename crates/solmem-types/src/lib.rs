//! `solmem-types` – shared vocabulary of the rover memory pipeline.
//!
//! # Modules
//!
//! - [`date`] – [`EarthDate`]: canonical `YYYY-MM-DD` calendar dates.
//! - [`sol`] – the Sol Converter ([`sol::earth_date_to_sol`]).
//! - [`stage`] – the stage contract: [`StageId`], [`StageResponse`],
//!   [`BatchOutcome`].
//! - [`error`] – the [`PipelineError`] taxonomy.
//!
//! The records below are the payloads that flow between stages:
//! Fetch produces [`Photo`]s, Generate turns each into a [`MemoryArtifact`],
//! and Embed indexes each artifact as an [`EmbeddingRecord`].

pub mod date;
pub mod error;
pub mod sol;
pub mod stage;

use serde::{Deserialize, Serialize};

pub use date::EarthDate;
pub use error::{CollaboratorError, PipelineError, StageFailure};
pub use sol::{SolConverter, earth_date_to_sol, landing_date};
pub use stage::{BatchOutcome, ItemFailure, ResponseBody, StageId, StageResponse, StageStatus};

/// Simulation id whose clock never advances, for repeatable runs.
pub const DRY_RUN_SIMULATION_ID: &str = "test";

/// A rover photo, the unit of per-item work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Photo {
    pub id: u64,
    pub earth_date: EarthDate,
    pub sol: u32,
    pub img_src: String,
}

/// A label reported by the image-labeling service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    /// Percentage in `0.0..=100.0`.
    pub confidence: f32,
}

/// Kind of narrative artifact derived from a photo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Memory,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Memory => "memory",
        }
    }
}

/// Narrative text generated from one photo, persisted to the content store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryArtifact {
    /// Deterministic id, `image{photo_id}_{kind}`.
    pub id: String,
    pub date: EarthDate,
    #[serde(rename = "type")]
    pub kind: ArtifactKind,
    /// Locator returned by the content store.
    pub content_ref: String,
    pub photo_id: u64,
    pub sol: u32,
    /// Labels that passed the confidence threshold.
    #[serde(default)]
    pub labels: Vec<String>,
}

impl MemoryArtifact {
    pub fn id_for(photo_id: u64, kind: ArtifactKind) -> String {
        format!("image{photo_id}_{}", kind.as_str())
    }
}

/// Metadata stored next to a vector in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingMetadata {
    pub date: EarthDate,
    #[serde(rename = "type")]
    pub kind: ArtifactKind,
    pub content_ref: String,
    pub photo_id: u64,
    pub text: String,
}

/// A vector derived from a [`MemoryArtifact`], ready for upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub memory_id: String,
    pub vector: Vec<f32>,
    pub metadata: EmbeddingMetadata,
}

/// Per-item output of the Embed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddedMemory {
    pub memory_id: String,
    pub date: EarthDate,
    #[serde(rename = "type")]
    pub kind: ArtifactKind,
    pub content_ref: String,
    pub dimensions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn photo_matches_imagery_wire_shape() {
        let json = r#"{"id": 1216944, "sol": 4061, "earth_date": "2024-01-08",
                       "img_src": "https://mars.nasa.gov/x.JPG"}"#;
        let photo: Photo = serde_json::from_str(json).unwrap();
        assert_eq!(photo.id, 1216944);
        assert_eq!(photo.earth_date.to_string(), "2024-01-08");
    }

    #[test]
    fn artifact_id_is_deterministic() {
        assert_eq!(MemoryArtifact::id_for(42, ArtifactKind::Memory), "image42_memory");
    }

    #[test]
    fn artifact_kind_serializes_as_type_field() {
        let artifact = MemoryArtifact {
            id: "image1_memory".into(),
            date: "2024-01-08".parse().unwrap(),
            kind: ArtifactKind::Memory,
            content_ref: "content://memories/2024-01-08/image1_memory.txt".into(),
            photo_id: 1,
            sol: 4061,
            labels: vec!["Rock".into()],
        };
        let v = serde_json::to_value(&artifact).unwrap();
        assert_eq!(v["type"], "memory");
        let back: MemoryArtifact = serde_json::from_value(v).unwrap();
        assert_eq!(back, artifact);
    }
}
