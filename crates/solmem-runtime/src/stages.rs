//! The four pipeline stages: Schedule → Fetch → Generate → Embed.
//!
//! Each stage implements [`Stage`]: a typed input, a typed output, and a
//! [`Stage::summarize`] that bounds what lands in the pipeline log. Stages
//! never touch the log themselves; [`Pipeline`][crate::pipeline::Pipeline]
//! records every outcome.
//!
//! | stage | input | output |
//! |---|---|---|
//! | [`ScheduleStage`] | `{simulation_id}` | [`ScheduleOutput`] |
//! | [`FetchStage`] | `{earth_date}` | `[Photo]` |
//! | [`GenerateStage`] | `{earth_date, fetch_result}` | `BatchOutcome<MemoryArtifact>` |
//! | [`EmbedStage`] | `{earth_date, generate_result}` | `BatchOutcome<EmbeddedMemory>` |

use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use solmem_memory::clock::ClockError;
use solmem_types::{
    ArtifactKind, BatchOutcome, CollaboratorError, DRY_RUN_SIMULATION_ID, EarthDate,
    EmbeddedMemory, EmbeddingMetadata, EmbeddingRecord, MemoryArtifact, Photo, PipelineError,
    SolConverter, StageFailure, StageId, StageResponse,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::collaborators::{
    ClockStore, ContentStore, Embedder, ImagerySource, LabelDetector, TextGenerator, VectorIndex,
};
use crate::fanout::fan_out;
use crate::retry::CallPolicy;

// ─────────────────────────────────────────────────────────────────────────────
// Stage trait
// ─────────────────────────────────────────────────────────────────────────────

/// What a successful stage run hands back to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome<T> {
    /// Ledger row the outcome belongs to.
    pub earth_date: EarthDate,
    /// Sol to store on the row, if this stage computed one.
    pub sol: Option<u32>,
    pub output: T,
}

/// One independently callable unit of the daily pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    type Input: DeserializeOwned + Send + 'static;
    type Output: Serialize + Send + 'static;

    const ID: StageId;

    async fn run(&self, input: Self::Input) -> Result<StageOutcome<Self::Output>, StageFailure>;

    /// Ledger-sized view of `output`.
    fn summarize(&self, output: &Self::Output) -> Value;
}

fn batch_summary<T>(batch: &BatchOutcome<T>, id: impl Fn(&T) -> &str) -> Value {
    json!({
        "succeeded": batch.succeeded.len(),
        "memory_ids": batch.succeeded.iter().map(id).collect::<Vec<_>>(),
        "failed": batch.failed,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Schedule
// ─────────────────────────────────────────────────────────────────────────────

fn default_simulation_id() -> String {
    DRY_RUN_SIMULATION_ID.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleInput {
    #[serde(default = "default_simulation_id")]
    pub simulation_id: String,
}

impl Default for ScheduleInput {
    fn default() -> Self {
        Self {
            simulation_id: default_simulation_id(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleOutput {
    pub simulation_id: String,
    /// Date this tick processes.
    pub earth_date: EarthDate,
    pub sol: u32,
    /// Date the clock holds after this tick.
    pub next_earth_date: EarthDate,
    pub run_id: Uuid,
}

/// Reads the simulation clock and advances it by one day.
pub struct ScheduleStage {
    clock: Arc<dyn ClockStore>,
    converter: SolConverter,
}

impl ScheduleStage {
    pub fn new(clock: Arc<dyn ClockStore>, converter: SolConverter) -> Self {
        Self { clock, converter }
    }

    /// Advance from a freshly read date; a lost race re-reads and tries once
    /// more before giving up.
    fn advance(&self, simulation_id: &str) -> Result<(EarthDate, EarthDate), StageFailure> {
        let current = self
            .clock
            .get_or_seed(simulation_id)
            .map_err(PipelineError::from)?;
        match self.clock.advance(simulation_id, current) {
            Ok(next) => return Ok((current, next)),
            Err(ClockError::Stale { .. }) => {
                warn!(simulation_id, expected = %current, "clock moved underneath us; re-reading");
            }
            Err(e) => return Err(PipelineError::from(e).at(current)),
        }

        let current = self
            .clock
            .current(simulation_id)
            .map_err(|e| PipelineError::from(e).at(current))?;
        match self.clock.advance(simulation_id, current) {
            Ok(next) => Ok((current, next)),
            Err(ClockError::Stale { expected, .. }) => Err(PipelineError::from(
                CollaboratorError::transient(
                    "clock_store",
                    format!("simulation '{simulation_id}' still stale after re-read (expected {expected})"),
                ),
            )
            .at(current)),
            Err(e) => Err(PipelineError::from(e).at(current)),
        }
    }
}

#[async_trait]
impl Stage for ScheduleStage {
    type Input = ScheduleInput;
    type Output = ScheduleOutput;

    const ID: StageId = StageId::Schedule;

    #[instrument(skip_all, fields(simulation_id = %input.simulation_id))]
    async fn run(&self, input: ScheduleInput) -> Result<StageOutcome<ScheduleOutput>, StageFailure> {
        let simulation_id = input.simulation_id.trim();
        if simulation_id.is_empty() {
            return Err(PipelineError::Validation("simulation_id must not be empty".into()).into());
        }

        let (earth_date, next_earth_date) = self.advance(simulation_id)?;
        let sol = self
            .converter
            .earth_date_to_sol(earth_date)
            .map_err(|e| e.at(earth_date))?;
        let run_id = Uuid::new_v4();
        info!(%earth_date, sol, %next_earth_date, %run_id, "scheduled tick");

        Ok(StageOutcome {
            earth_date,
            sol: Some(sol),
            output: ScheduleOutput {
                simulation_id: simulation_id.to_string(),
                earth_date,
                sol,
                next_earth_date,
                run_id,
            },
        })
    }

    fn summarize(&self, output: &ScheduleOutput) -> Value {
        json!({
            "simulation_id": output.simulation_id,
            "earth_date": output.earth_date,
            "sol": output.sol,
            "next_earth_date": output.next_earth_date,
            "run_id": output.run_id,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Fetch
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchInput {
    pub earth_date: EarthDate,
}

/// Lists the day's photos and samples a handful of them.
pub struct FetchStage {
    imagery: Arc<dyn ImagerySource>,
    converter: SolConverter,
    sampled_image_count: usize,
    policy: CallPolicy,
}

impl FetchStage {
    pub fn new(
        imagery: Arc<dyn ImagerySource>,
        converter: SolConverter,
        sampled_image_count: usize,
        policy: CallPolicy,
    ) -> Self {
        Self {
            imagery,
            converter,
            sampled_image_count,
            policy,
        }
    }
}

#[async_trait]
impl Stage for FetchStage {
    type Input = FetchInput;
    type Output = Vec<Photo>;

    const ID: StageId = StageId::Fetch;

    #[instrument(skip_all, fields(earth_date = %input.earth_date))]
    async fn run(&self, input: FetchInput) -> Result<StageOutcome<Vec<Photo>>, StageFailure> {
        let earth_date = input.earth_date;
        let sol = self
            .converter
            .earth_date_to_sol(earth_date)
            .map_err(|e| e.at(earth_date))?;

        let imagery = &self.imagery;
        let mut photos = self
            .policy
            .call("imagery", move || imagery.photos(earth_date, sol))
            .await
            .map_err(|e| PipelineError::from(e).at(earth_date))?;

        let available = photos.len();
        photos.shuffle(&mut rand::rng());
        photos.truncate(self.sampled_image_count);
        if photos.is_empty() {
            warn!(%earth_date, sol, "no photos for this date");
        } else {
            info!(%earth_date, sol, available, sampled = photos.len(), "sampled photos");
        }

        Ok(StageOutcome {
            earth_date,
            sol: Some(sol),
            output: photos,
        })
    }

    fn summarize(&self, output: &Vec<Photo>) -> Value {
        json!({
            "photo_count": output.len(),
            "photo_ids": output.iter().map(|p| p.id).collect::<Vec<_>>(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Generate
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateInput {
    pub earth_date: EarthDate,
    pub fetch_result: StageResponse<Vec<Photo>>,
}

/// Render the rover-persona prompt for one photo.
pub fn memory_prompt(photo: &Photo, features: &[String]) -> String {
    format!(
        "You are Curiosity, NASA's Mars rover, exploring the Red Planet. \
Your mission is to observe, analyze, and document the Martian landscape in detail. \
Every day you look at the world around you through photos and keep a memory entry \
in this format:

Memory Entry:
- Data:
  - Date: [Earth date]
  - Sol: [Martian sol]
  - URL: [URL of the image]
  - Features: [features identified in the image]
- Interpretation:
  - Description: [the scene in detail: colors, shapes, textures, key geological features]
  - Speculation: [educated guesses about the location, geological processes or history behind these features]
  - Reflection: [what this image means for your journey as an explorer, and how you imagine humans will react to it]

Today's image and context:
- Date: {date}
- Sol: {sol}
- URL: {url}
- Features: {features}

Write the memory entry.",
        date = photo.earth_date,
        sol = photo.sol,
        url = photo.img_src,
        features = features.join(", "),
    )
}

/// Content-store key of a memory artifact.
pub fn memory_key(date: EarthDate, memory_id: &str) -> String {
    format!("memories/{date}/{memory_id}.txt")
}

/// Turns each photo into a stored narrative memory.
pub struct GenerateStage {
    imagery: Arc<dyn ImagerySource>,
    labels: Arc<dyn LabelDetector>,
    text: Arc<dyn TextGenerator>,
    content: Arc<dyn ContentStore>,
    min_label_confidence: f32,
    max_concurrency: usize,
    policy: CallPolicy,
}

impl GenerateStage {
    pub fn new(
        imagery: Arc<dyn ImagerySource>,
        labels: Arc<dyn LabelDetector>,
        text: Arc<dyn TextGenerator>,
        content: Arc<dyn ContentStore>,
        min_label_confidence: f32,
        max_concurrency: usize,
        policy: CallPolicy,
    ) -> Self {
        Self {
            imagery,
            labels,
            text,
            content,
            min_label_confidence,
            max_concurrency,
            policy,
        }
    }

    async fn generate_one(&self, photo: Photo) -> Result<MemoryArtifact, PipelineError> {
        let (imagery, labels, text, content) = (&self.imagery, &self.labels, &self.text, &self.content);
        let photo_ref = &photo;

        let image = self
            .policy
            .call("imagery", move || imagery.download(photo_ref))
            .await?;
        let image = image.as_slice();
        let detected = self
            .policy
            .call("label_detector", move || labels.detect_labels(image))
            .await?;
        let features: Vec<String> = detected
            .into_iter()
            .filter(|l| l.confidence > self.min_label_confidence)
            .map(|l| l.name)
            .collect();
        debug!(photo_id = photo.id, features = ?features, "labels above threshold");

        let prompt = memory_prompt(&photo, &features);
        let prompt = prompt.as_str();
        let memory = self
            .policy
            .call("text_generator", move || text.generate(prompt))
            .await?;

        let id = MemoryArtifact::id_for(photo.id, ArtifactKind::Memory);
        let key = memory_key(photo.earth_date, &id);
        let (key_ref, memory_ref) = (key.as_str(), memory.as_str());
        let content_ref = self
            .policy
            .call("content_store", move || {
                content.put(key_ref, memory_ref.as_bytes().to_vec())
            })
            .await?;

        Ok(MemoryArtifact {
            id,
            date: photo.earth_date,
            kind: ArtifactKind::Memory,
            content_ref,
            photo_id: photo.id,
            sol: photo.sol,
            labels: features,
        })
    }
}

#[async_trait]
impl Stage for GenerateStage {
    type Input = GenerateInput;
    type Output = BatchOutcome<MemoryArtifact>;

    const ID: StageId = StageId::Generate;

    #[instrument(skip_all, fields(earth_date = %input.earth_date))]
    async fn run(
        &self,
        input: GenerateInput,
    ) -> Result<StageOutcome<BatchOutcome<MemoryArtifact>>, StageFailure> {
        let earth_date = input.earth_date;
        let photos = input
            .fetch_result
            .into_result()
            .map_err(|e| e.at(earth_date))?;

        let outcome = fan_out(
            photos,
            self.max_concurrency,
            |p: &Photo| p.id,
            move |photo| self.generate_one(photo),
        )
        .await;
        info!(
            %earth_date,
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "generated memories"
        );

        Ok(StageOutcome {
            earth_date,
            sol: None,
            output: outcome,
        })
    }

    fn summarize(&self, output: &BatchOutcome<MemoryArtifact>) -> Value {
        batch_summary(output, |m| m.id.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Embed
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedInput {
    pub earth_date: EarthDate,
    pub generate_result: StageResponse<BatchOutcome<MemoryArtifact>>,
}

/// Embedding input: the stored text on a single line.
pub fn flatten_text(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .replace("\r\n", " ")
        .replace(['\n', '\r'], " ")
}

/// Embeds each stored memory and upserts it into the vector index.
pub struct EmbedStage {
    content: Arc<dyn ContentStore>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    max_concurrency: usize,
    policy: CallPolicy,
}

impl EmbedStage {
    pub fn new(
        content: Arc<dyn ContentStore>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        max_concurrency: usize,
        policy: CallPolicy,
    ) -> Self {
        Self {
            content,
            embedder,
            index,
            max_concurrency,
            policy,
        }
    }

    async fn embed_one(&self, artifact: MemoryArtifact) -> Result<EmbeddedMemory, PipelineError> {
        let (content, embedder, index) = (&self.content, &self.embedder, &self.index);
        let locator = artifact.content_ref.as_str();

        let raw = self
            .policy
            .call("content_store", move || content.get(locator))
            .await?;
        let text = flatten_text(&raw);
        let text_ref = text.as_str();
        let vector = self
            .policy
            .call("embedder", move || embedder.embed(text_ref))
            .await?;
        let dimensions = vector.len();

        let record = EmbeddingRecord {
            memory_id: artifact.id.clone(),
            vector,
            metadata: EmbeddingMetadata {
                date: artifact.date,
                kind: artifact.kind,
                content_ref: artifact.content_ref.clone(),
                photo_id: artifact.photo_id,
                text,
            },
        };
        let record_ref = &record;
        self.policy
            .call("vector_index", move || index.upsert(record_ref.clone()))
            .await?;
        debug!(memory_id = %artifact.id, dimensions, "memory indexed");

        Ok(EmbeddedMemory {
            memory_id: artifact.id,
            date: artifact.date,
            kind: artifact.kind,
            content_ref: artifact.content_ref,
            dimensions,
        })
    }
}

#[async_trait]
impl Stage for EmbedStage {
    type Input = EmbedInput;
    type Output = BatchOutcome<EmbeddedMemory>;

    const ID: StageId = StageId::Embed;

    #[instrument(skip_all, fields(earth_date = %input.earth_date))]
    async fn run(
        &self,
        input: EmbedInput,
    ) -> Result<StageOutcome<BatchOutcome<EmbeddedMemory>>, StageFailure> {
        let earth_date = input.earth_date;
        let artifacts = input
            .generate_result
            .into_result()
            .map_err(|e| e.at(earth_date))?
            .succeeded;

        let outcome = fan_out(
            artifacts,
            self.max_concurrency,
            |a: &MemoryArtifact| a.photo_id,
            move |artifact| self.embed_one(artifact),
        )
        .await;
        info!(
            %earth_date,
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "embedded memories"
        );

        Ok(StageOutcome {
            earth_date,
            sol: None,
            output: outcome,
        })
    }

    fn summarize(&self, output: &BatchOutcome<EmbeddedMemory>) -> Value {
        batch_summary(output, |m| m.memory_id.as_str())
    }
}
