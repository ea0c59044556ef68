//! [`Pipeline`] – the stage orchestrator.
//!
//! Runs stages strictly one after another, records every outcome in the
//! [`PipelineLog`], and hands each stage's full output to the next stage
//! verbatim.
//!
//! # Ledger policy
//!
//! | outcome | ledger |
//! |---|---|
//! | success (including partial fan-out) | `SUCCESS` with the stage summary; a failed write is logged and the output still returned |
//! | failure with a known earth date | `FAILED` with `{"error": message}` |
//! | failure before the date is known | nothing written |
//!
//! Errors are returned to the caller after recording; the orchestrator never
//! retries a whole stage.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn demo(pipeline: solmem_runtime::pipeline::Pipeline) {
//! let report = pipeline.run_tick("sim1").await.unwrap();
//! println!("processed {}", report.schedule.earth_date);
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Value, json};
use solmem_memory::pipeline_log::PipelineLog;
use solmem_types::{
    BatchOutcome, EmbeddedMemory, MemoryArtifact, Photo, PipelineError, SolConverter,
    StageFailure, StageId, StageResponse, StageStatus,
};
use tracing::{error, info, instrument};

use crate::collaborators::{ClockStore, Collaborators};
use crate::retry::CallPolicy;
use crate::stages::{
    EmbedInput, EmbedStage, FetchInput, FetchStage, GenerateInput, GenerateStage, ScheduleInput,
    ScheduleOutput, ScheduleStage, Stage,
};

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

/// Tunables shared by all stages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineSettings {
    /// Maximum photos processed per run.
    pub sampled_image_count: usize,
    /// Labels must score strictly above this percentage.
    pub min_label_confidence: f32,
    pub sol_length_in_days: f64,
    /// Per-photo workers inside Generate and Embed.
    pub max_concurrency: usize,
    pub call_policy: CallPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            sampled_image_count: 5,
            min_label_confidence: 95.0,
            sol_length_in_days: solmem_types::sol::SOL_LENGTH_IN_DAYS,
            max_concurrency: 4,
            call_policy: CallPolicy::default(),
        }
    }
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.sampled_image_count == 0 {
            return Err(PipelineError::Configuration(
                "sampled_image_count must be at least 1".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.min_label_confidence) {
            return Err(PipelineError::Configuration(format!(
                "min_label_confidence must be within 0..=100, got {}",
                self.min_label_confidence
            )));
        }
        if self.max_concurrency == 0 {
            return Err(PipelineError::Configuration(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if self.call_policy.timeout.is_zero() {
            return Err(PipelineError::Configuration(
                "call timeout must be positive".into(),
            ));
        }
        SolConverter::new(self.sol_length_in_days).map(|_| ())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tick report
// ─────────────────────────────────────────────────────────────────────────────

/// Everything one full Schedule → Fetch → Generate → Embed run produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    pub schedule: ScheduleOutput,
    pub photos: Vec<Photo>,
    pub memories: BatchOutcome<MemoryArtifact>,
    pub embedded: BatchOutcome<EmbeddedMemory>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline
// ─────────────────────────────────────────────────────────────────────────────

/// Orchestrates the four stages against one clock and one pipeline log.
pub struct Pipeline {
    log: Arc<PipelineLog>,
    schedule: ScheduleStage,
    fetch: FetchStage,
    generate: GenerateStage,
    embed: EmbedStage,
}

impl Pipeline {
    /// Wire the stages.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Configuration`] when `settings` are invalid.
    pub fn new(
        clock: Arc<dyn ClockStore>,
        log: Arc<PipelineLog>,
        collaborators: Collaborators,
        settings: PipelineSettings,
    ) -> Result<Self, PipelineError> {
        settings.validate()?;
        let converter = SolConverter::new(settings.sol_length_in_days)?;
        let policy = settings.call_policy;
        let Collaborators {
            imagery,
            labels,
            text,
            embedder,
            content,
            index,
        } = collaborators;

        Ok(Self {
            log,
            schedule: ScheduleStage::new(clock, converter),
            fetch: FetchStage::new(
                imagery.clone(),
                converter,
                settings.sampled_image_count,
                policy,
            ),
            generate: GenerateStage::new(
                imagery,
                labels,
                text,
                content.clone(),
                settings.min_label_confidence,
                settings.max_concurrency,
                policy,
            ),
            embed: EmbedStage::new(content, embedder, index, settings.max_concurrency, policy),
        })
    }

    pub fn log(&self) -> &PipelineLog {
        &self.log
    }

    /// Run `stage` and record its outcome.
    #[instrument(skip_all, fields(stage = %S::ID))]
    pub async fn invoke<S: Stage>(&self, stage: &S, input: S::Input) -> Result<S::Output, PipelineError> {
        match stage.run(input).await {
            Ok(outcome) => {
                // Effects are committed (Schedule has moved the clock); a
                // ledger outage is logged, never returned.
                let summary = stage.summarize(&outcome.output);
                if let Err(e) = self.log.record(
                    outcome.earth_date,
                    S::ID,
                    StageStatus::Success,
                    &summary,
                    outcome.sol,
                ) {
                    error!(
                        earth_date = %outcome.earth_date,
                        stage = %S::ID,
                        error = %e,
                        "could not record stage success"
                    );
                }
                info!(earth_date = %outcome.earth_date, stage = %S::ID, "stage succeeded");
                Ok(outcome.output)
            }
            Err(StageFailure { earth_date, error }) => {
                error!(
                    earth_date = ?earth_date,
                    stage = %S::ID,
                    retryable = error.is_retryable(),
                    error = %error,
                    "stage failed"
                );
                if let Some(date) = earth_date {
                    let output = json!({ "error": error.to_string() });
                    if let Err(e) = self.log.record(date, S::ID, StageStatus::Failed, &output, None) {
                        error!(earth_date = %date, stage = %S::ID, error = %e, "could not record stage failure");
                    }
                }
                Err(error)
            }
        }
    }

    pub async fn schedule(&self, input: ScheduleInput) -> Result<ScheduleOutput, PipelineError> {
        self.invoke(&self.schedule, input).await
    }

    pub async fn fetch(&self, input: FetchInput) -> Result<Vec<Photo>, PipelineError> {
        self.invoke(&self.fetch, input).await
    }

    pub async fn generate(
        &self,
        input: GenerateInput,
    ) -> Result<BatchOutcome<MemoryArtifact>, PipelineError> {
        self.invoke(&self.generate, input).await
    }

    pub async fn embed(
        &self,
        input: EmbedInput,
    ) -> Result<BatchOutcome<EmbeddedMemory>, PipelineError> {
        self.invoke(&self.embed, input).await
    }

    /// One full Schedule → Fetch → Generate → Embed run for `simulation_id`.
    ///
    /// Stops at the first failing stage; stages that already completed keep
    /// their ledger entries.
    #[instrument(skip(self))]
    pub async fn run_tick(&self, simulation_id: &str) -> Result<TickReport, PipelineError> {
        let schedule = self
            .schedule(ScheduleInput {
                simulation_id: simulation_id.to_string(),
            })
            .await?;
        let earth_date = schedule.earth_date;

        let photos = self.fetch(FetchInput { earth_date }).await?;
        let memories = self
            .generate(GenerateInput {
                earth_date,
                fetch_result: StageResponse::ok(photos.clone()),
            })
            .await?;
        let embedded = self
            .embed(EmbedInput {
                earth_date,
                generate_result: StageResponse::ok(memories.clone()),
            })
            .await?;

        info!(
            %earth_date,
            photos = photos.len(),
            memories = memories.succeeded.len(),
            embedded = embedded.succeeded.len(),
            "tick complete"
        );
        Ok(TickReport {
            schedule,
            photos,
            memories,
            embedded,
        })
    }

    /// Run one stage from a driver payload and report `{statusCode, body}`.
    ///
    /// A payload that does not parse into the stage's input is a validation
    /// failure and writes nothing to the ledger.
    pub async fn handle(&self, stage: StageId, payload: Value) -> StageResponse<Value> {
        let payload = if payload.is_null() { json!({}) } else { payload };
        let result = match stage {
            StageId::Schedule => dispatch(payload, |i| self.schedule(i)).await,
            StageId::Fetch => dispatch(payload, |i| self.fetch(i)).await,
            StageId::Generate => dispatch(payload, |i| self.generate(i)).await,
            StageId::Embed => dispatch(payload, |i| self.embed(i)).await,
        };
        StageResponse::from_result(result)
    }
}

async fn dispatch<I, O, F, Fut>(payload: Value, run: F) -> Result<Value, PipelineError>
where
    I: DeserializeOwned,
    O: Serialize,
    F: FnOnce(I) -> Fut,
    Fut: Future<Output = Result<O, PipelineError>>,
{
    let input: I = serde_json::from_value(payload)
        .map_err(|e| PipelineError::Validation(format!("invalid stage payload: {e}")))?;
    let output = run(input).await?;
    serde_json::to_value(output)
        .map_err(|e| PipelineError::Validation(format!("stage output is not JSON: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use solmem_memory::clock::{ClockError, SimulationClock};
    use solmem_memory::content_store::FsContentStore;
    use solmem_memory::vector_index::VectorIndex as SqliteVectorIndex;
    use solmem_types::{CollaboratorError, EarthDate, Label};

    use crate::collaborators::{Embedder, ImagerySource, LabelDetector, TextGenerator};

    // ── Test doubles ────────────────────────────────────────────────────────

    #[derive(Default)]
    struct FakeImagery {
        photos: Vec<Photo>,
        fail_listing: bool,
    }

    #[async_trait]
    impl ImagerySource for FakeImagery {
        async fn photos(&self, _: EarthDate, _: u32) -> Result<Vec<Photo>, CollaboratorError> {
            if self.fail_listing {
                return Err(CollaboratorError::permanent("imagery", "403 Forbidden"));
            }
            Ok(self.photos.clone())
        }

        async fn download(&self, photo: &Photo) -> Result<Vec<u8>, CollaboratorError> {
            Ok(photo.id.to_le_bytes().to_vec())
        }
    }

    /// Fails label detection for the photo ids in `failing`.
    #[derive(Default)]
    struct FakeLabels {
        failing: HashSet<u64>,
    }

    #[async_trait]
    impl LabelDetector for FakeLabels {
        async fn detect_labels(&self, image: &[u8]) -> Result<Vec<Label>, CollaboratorError> {
            let mut id = [0u8; 8];
            id.copy_from_slice(&image[..8]);
            let id = u64::from_le_bytes(id);
            if self.failing.contains(&id) {
                return Err(CollaboratorError::permanent("label_detector", format!("cannot label {id}")));
            }
            Ok(vec![
                Label { name: "Rock".into(), confidence: 99.0 },
                Label { name: "Sky".into(), confidence: 95.0 },
            ])
        }
    }

    struct FakeText;

    #[async_trait]
    impl TextGenerator for FakeText {
        async fn generate(&self, prompt: &str) -> Result<String, CollaboratorError> {
            let features = prompt
                .lines()
                .find(|l| l.starts_with("- Features:"))
                .unwrap_or_default();
            Ok(format!("Memory Entry:\n{features}"))
        }
    }

    #[derive(Default)]
    struct FakeEmbedder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Embedder for FakeEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, CollaboratorError> {
            self.seen.lock().unwrap().push(text.to_string());
            Ok(vec![text.len() as f32, 1.0, 0.5])
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        clock: Arc<SimulationClock>,
        index: Arc<SqliteVectorIndex>,
        embedder: Arc<FakeEmbedder>,
        pipeline: Pipeline,
    }

    fn photo(id: u64) -> Photo {
        Photo {
            id,
            earth_date: d("2012-08-06"),
            sol: 1,
            img_src: format!("https://mars.nasa.gov/{id}.JPG"),
        }
    }

    fn d(s: &str) -> EarthDate {
        s.parse().unwrap()
    }

    /// Moves the stored date on behind the stage's back before each of the
    /// first `races` advances.
    struct RacingClock {
        inner: Arc<SimulationClock>,
        races: AtomicUsize,
    }

    impl ClockStore for RacingClock {
        fn get_or_seed(&self, simulation_id: &str) -> Result<EarthDate, ClockError> {
            self.inner.get_or_seed(simulation_id)
        }

        fn current(&self, simulation_id: &str) -> Result<EarthDate, ClockError> {
            self.inner.current(simulation_id)
        }

        fn advance(&self, simulation_id: &str, expected: EarthDate) -> Result<EarthDate, ClockError> {
            let race = self
                .races
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if race {
                let stored = self.inner.current(simulation_id)?;
                self.inner.advance(simulation_id, stored)?;
            }
            self.inner.advance(simulation_id, expected)
        }
    }

    fn make_harness(imagery: FakeImagery, labels: FakeLabels) -> Harness {
        let clock = Arc::new(SimulationClock::open_in_memory().unwrap());
        let log = Arc::new(PipelineLog::open_in_memory().unwrap());
        build_harness(imagery, labels, clock.clone(), clock, log)
    }

    fn build_harness(
        imagery: FakeImagery,
        labels: FakeLabels,
        clock: Arc<SimulationClock>,
        store: Arc<dyn ClockStore>,
        log: Arc<PipelineLog>,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(SqliteVectorIndex::open_in_memory().unwrap());
        let embedder = Arc::new(FakeEmbedder::default());
        let collaborators = Collaborators {
            imagery: Arc::new(imagery),
            labels: Arc::new(labels),
            text: Arc::new(FakeText),
            embedder: embedder.clone(),
            content: Arc::new(FsContentStore::open(dir.path()).unwrap()),
            index: index.clone(),
        };
        let settings = PipelineSettings {
            call_policy: CallPolicy {
                timeout: Duration::from_secs(5),
                max_attempts: 2,
                backoff_base: Duration::from_millis(1),
                backoff_max: Duration::from_millis(2),
            },
            ..PipelineSettings::default()
        };
        let pipeline = Pipeline::new(store, log, collaborators, settings).unwrap();
        Harness {
            _dir: dir,
            clock,
            index,
            embedder,
            pipeline,
        }
    }

    // ── Scenarios ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn full_tick_processes_landing_date_and_advances_clock() {
        let h = make_harness(
            FakeImagery {
                photos: (1..=3).map(photo).collect(),
                ..Default::default()
            },
            FakeLabels::default(),
        );

        let report = h.pipeline.run_tick("sim1").await.unwrap();

        assert_eq!(report.schedule.earth_date, d("2012-08-06"));
        assert_eq!(report.schedule.sol, 1);
        assert_eq!(report.schedule.next_earth_date, d("2012-08-07"));
        assert_eq!(h.clock.current("sim1").unwrap(), d("2012-08-07"));
        assert_eq!(report.memories.succeeded.len(), 3);
        assert_eq!(report.embedded.succeeded.len(), 3);
        assert_eq!(h.index.len().unwrap(), 3);

        let entry = h.pipeline.log().read(d("2012-08-06")).unwrap();
        assert_eq!(entry.sol, Some(1));
        for id in StageId::ALL {
            assert_eq!(entry.stage(id).unwrap().status, StageStatus::Success, "{id}");
        }
    }

    #[tokio::test]
    async fn generated_memories_keep_only_confident_labels() {
        let h = make_harness(
            FakeImagery {
                photos: vec![photo(9)],
                ..Default::default()
            },
            FakeLabels::default(),
        );
        let report = h.pipeline.run_tick("sim1").await.unwrap();

        let memory = &report.memories.succeeded[0];
        assert_eq!(memory.id, "image9_memory");
        assert_eq!(memory.content_ref, "content://memories/2012-08-06/image9_memory.txt");
        // 95.0 is not strictly above the 95.0 threshold.
        assert_eq!(memory.labels, vec!["Rock".to_string()]);

        let seen = h.embedder.seen.lock().unwrap().clone();
        assert_eq!(seen, vec!["Memory Entry: - Features: Rock".to_string()]);
    }

    #[tokio::test]
    async fn zero_photos_flow_through_as_empty_bodies() {
        let h = make_harness(FakeImagery::default(), FakeLabels::default());

        let fetched = h
            .pipeline
            .handle(StageId::Fetch, json!({"earth_date": "2012-08-06"}))
            .await;
        assert_eq!(serde_json::to_value(&fetched).unwrap(), json!({"statusCode": 200, "body": []}));

        let generated = h
            .pipeline
            .handle(
                StageId::Generate,
                json!({"earth_date": "2012-08-06", "fetch_result": fetched}),
            )
            .await;
        assert_eq!(serde_json::to_value(&generated).unwrap(), json!({"statusCode": 200, "body": []}));

        let embedded = h
            .pipeline
            .handle(
                StageId::Embed,
                json!({"earth_date": "2012-08-06", "generate_result": generated}),
            )
            .await;
        assert_eq!(serde_json::to_value(&embedded).unwrap(), json!({"statusCode": 200, "body": []}));

        let entry = h.pipeline.log().read(d("2012-08-06")).unwrap();
        for id in [StageId::Fetch, StageId::Generate, StageId::Embed] {
            assert_eq!(entry.stage(id).unwrap().status, StageStatus::Success);
        }
    }

    #[tokio::test]
    async fn one_label_failure_is_isolated_and_recorded_as_success() {
        let h = make_harness(
            FakeImagery {
                photos: (1..=5).map(photo).collect(),
                ..Default::default()
            },
            FakeLabels {
                failing: HashSet::from([3]),
            },
        );

        let photos: Vec<Photo> = (1..=5).map(photo).collect();
        let response = h
            .pipeline
            .handle(
                StageId::Generate,
                json!({
                    "earth_date": "2012-08-06",
                    "fetch_result": {"statusCode": 200, "body": photos}
                }),
            )
            .await;

        let v = serde_json::to_value(&response).unwrap();
        assert_eq!(v["statusCode"], 200);
        assert_eq!(v["body"]["succeeded"].as_array().unwrap().len(), 4);
        assert_eq!(v["body"]["failed"][0]["photo_id"], 3);
        assert!(v["body"]["failed"][0]["error"].as_str().unwrap().contains("cannot label 3"));

        let entry = h.pipeline.log().read(d("2012-08-06")).unwrap();
        let generate = entry.stage(StageId::Generate).unwrap();
        assert_eq!(generate.status, StageStatus::Success);
        assert_eq!(generate.output["succeeded"], 4);
        assert_eq!(generate.output["failed"][0]["photo_id"], 3);
    }

    #[tokio::test]
    async fn collaborator_failure_is_recorded_then_propagated() {
        let h = make_harness(
            FakeImagery {
                fail_listing: true,
                ..Default::default()
            },
            FakeLabels::default(),
        );

        let err = h
            .pipeline
            .fetch(FetchInput {
                earth_date: d("2012-08-07"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Collaborator(_)));
        assert!(err.is_retryable());

        let entry = h.pipeline.log().read(d("2012-08-07")).unwrap();
        let fetch = entry.stage(StageId::Fetch).unwrap();
        assert_eq!(fetch.status, StageStatus::Failed);
        assert!(fetch.output["error"].as_str().unwrap().contains("403 Forbidden"));
    }

    #[tokio::test]
    async fn unparseable_payload_is_validation_without_ledger_write() {
        let h = make_harness(FakeImagery::default(), FakeLabels::default());

        let response = h
            .pipeline
            .handle(StageId::Fetch, json!({"earth_date": "2024-13-45"}))
            .await;
        let v = serde_json::to_value(&response).unwrap();
        assert_eq!(v["statusCode"], 500);
        assert!(v["body"]["error"].as_str().unwrap().contains("validation"));
        assert!(h.pipeline.log().recent(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn date_before_landing_is_rejected_and_logged() {
        let h = make_harness(FakeImagery::default(), FakeLabels::default());
        let err = h
            .pipeline
            .fetch(FetchInput {
                earth_date: d("2012-08-05"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert!(!err.is_retryable());
        let entry = h.pipeline.log().read(d("2012-08-05")).unwrap();
        assert_eq!(entry.fetch.unwrap().status, StageStatus::Failed);
    }

    #[tokio::test]
    async fn failed_upstream_result_fails_downstream_stage() {
        let h = make_harness(FakeImagery::default(), FakeLabels::default());
        let response = h
            .pipeline
            .handle(
                StageId::Generate,
                json!({
                    "earth_date": "2012-08-06",
                    "fetch_result": {"statusCode": 500, "body": {"error": "imagery down"}}
                }),
            )
            .await;
        assert!(!response.is_success());
        let entry = h.pipeline.log().read(d("2012-08-06")).unwrap();
        assert_eq!(entry.generate.unwrap().status, StageStatus::Failed);
    }

    #[tokio::test]
    async fn dry_run_schedule_never_advances() {
        let h = make_harness(FakeImagery::default(), FakeLabels::default());
        for _ in 0..3 {
            let response = h.pipeline.handle(StageId::Schedule, Value::Null).await;
            let v = serde_json::to_value(&response).unwrap();
            assert_eq!(v["statusCode"], 200);
            assert_eq!(v["body"]["simulation_id"], "test");
            assert_eq!(v["body"]["earth_date"], "2012-08-06");
        }
        assert_eq!(h.clock.current("test").unwrap(), d("2012-08-06"));
    }

    #[tokio::test]
    async fn consecutive_ticks_walk_the_calendar() {
        let h = make_harness(FakeImagery::default(), FakeLabels::default());
        let mut dates = Vec::new();
        for _ in 0..3 {
            dates.push(h.pipeline.run_tick("sim2").await.unwrap().schedule.earth_date);
        }
        assert_eq!(dates, vec![d("2012-08-06"), d("2012-08-07"), d("2012-08-08")]);
        assert_eq!(h.clock.current("sim2").unwrap(), d("2012-08-09"));
    }

    #[tokio::test]
    async fn empty_simulation_id_is_validation_without_ledger_write() {
        let h = make_harness(FakeImagery::default(), FakeLabels::default());
        let err = h.pipeline.run_tick("  ").await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert!(h.pipeline.log().recent(10).unwrap().is_empty());
    }

    fn racing_harness(races: usize) -> Harness {
        let clock = Arc::new(SimulationClock::open_in_memory().unwrap());
        let racing = Arc::new(RacingClock {
            inner: clock.clone(),
            races: AtomicUsize::new(races),
        });
        let log = Arc::new(PipelineLog::open_in_memory().unwrap());
        build_harness(FakeImagery::default(), FakeLabels::default(), clock, racing, log)
    }

    fn schedule_input(simulation_id: &str) -> ScheduleInput {
        ScheduleInput {
            simulation_id: simulation_id.into(),
        }
    }

    #[tokio::test]
    async fn lost_clock_race_rereads_and_advances_once() {
        let h = racing_harness(1);

        let out = h.pipeline.schedule(schedule_input("sim1")).await.unwrap();

        // The other writer took 2012-08-06; this tick gets the next day.
        assert_eq!(out.earth_date, d("2012-08-07"));
        assert_eq!(out.next_earth_date, d("2012-08-08"));
        assert_eq!(h.clock.current("sim1").unwrap(), d("2012-08-08"));
        let entry = h.pipeline.log().read(d("2012-08-07")).unwrap();
        assert_eq!(entry.schedule.unwrap().status, StageStatus::Success);
    }

    #[tokio::test]
    async fn clock_still_stale_after_reread_is_transient_collaborator_error() {
        let h = racing_harness(2);

        let err = h.pipeline.schedule(schedule_input("sim1")).await.unwrap_err();

        match &err {
            PipelineError::Collaborator(c) => {
                assert_eq!(c.service, "clock_store");
                assert!(c.transient);
            }
            other => panic!("expected collaborator error, got {other:?}"),
        }
        assert!(err.is_retryable());
        // Both advances lost; only the other writer moved the clock.
        assert_eq!(h.clock.current("sim1").unwrap(), d("2012-08-08"));
        let entry = h.pipeline.log().read(d("2012-08-07")).unwrap();
        let record = entry.schedule.unwrap();
        assert_eq!(record.status, StageStatus::Failed);
        assert!(record.output["error"].as_str().unwrap().contains("clock_store"));
    }

    #[tokio::test]
    async fn ledger_outage_keeps_committed_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("solmem.db");
        let db = db.to_str().unwrap();
        let clock = Arc::new(SimulationClock::open_in_memory().unwrap());
        let log = Arc::new(PipelineLog::open(db).unwrap());
        let h = build_harness(
            FakeImagery::default(),
            FakeLabels::default(),
            clock.clone(),
            clock,
            log,
        );
        rusqlite::Connection::open(db)
            .unwrap()
            .execute_batch("DROP TABLE pipeline_log;")
            .unwrap();

        let first = h.pipeline.schedule(schedule_input("sim1")).await.unwrap();
        assert_eq!(first.earth_date, d("2012-08-06"));
        assert_eq!(h.clock.current("sim1").unwrap(), d("2012-08-07"));

        // A driver retry continues from the next day instead of skipping one.
        let second = h.pipeline.schedule(schedule_input("sim1")).await.unwrap();
        assert_eq!(second.earth_date, d("2012-08-07"));
        assert_eq!(h.clock.current("sim1").unwrap(), d("2012-08-08"));
    }

    #[tokio::test]
    async fn sampling_caps_photo_count() {
        let h = make_harness(
            FakeImagery {
                photos: (1..=12).map(photo).collect(),
                ..Default::default()
            },
            FakeLabels::default(),
        );
        let photos = h
            .pipeline
            .fetch(FetchInput {
                earth_date: d("2012-08-06"),
            })
            .await
            .unwrap();
        assert_eq!(photos.len(), 5);
        let unique: HashSet<u64> = photos.iter().map(|p| p.id).collect();
        assert_eq!(unique.len(), 5);
    }

    #[test]
    fn invalid_settings_are_configuration_errors() {
        let bad = [
            PipelineSettings {
                sampled_image_count: 0,
                ..Default::default()
            },
            PipelineSettings {
                min_label_confidence: 120.0,
                ..Default::default()
            },
            PipelineSettings {
                sol_length_in_days: 0.0,
                ..Default::default()
            },
            PipelineSettings {
                max_concurrency: 0,
                ..Default::default()
            },
        ];
        for settings in bad {
            assert!(matches!(settings.validate(), Err(PipelineError::Configuration(_))));
        }
        assert!(PipelineSettings::default().validate().is_ok());
    }
}
