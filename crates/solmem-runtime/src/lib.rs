//! `solmem-runtime` – the daily memory pipeline engine.
//!
//! Where the rover's day is turned into memories: the four stages, the
//! orchestrator that sequences and records them, and the clients for the
//! external services they call.
//!
//! # Modules
//!
//! - [`pipeline`] – [`Pipeline`][pipeline::Pipeline]: runs Schedule → Fetch →
//!   Generate → Embed, recording every outcome in the pipeline log, and
//!   dispatches single-stage driver payloads via
//!   [`Pipeline::handle`][pipeline::Pipeline::handle].
//! - [`stages`] – the [`Stage`][stages::Stage] contract and its four
//!   implementations.
//! - [`fanout`] – bounded per-photo concurrency with failure isolation.
//! - [`collaborators`] – the [`ClockStore`][collaborators::ClockStore] seam
//!   plus traits for the imagery source, label detector, text generator,
//!   embedder, content store and vector index, bundled as
//!   [`Collaborators`][collaborators::Collaborators] for injection.
//! - [`retry`] – [`CallPolicy`][retry::CallPolicy]: timeout plus bounded
//!   retry with backoff at every collaborator call.
//! - [`nasa`] – [`NasaImagery`][nasa::NasaImagery]: Mars Rover Photos API
//!   client with client-side rate limiting.
//! - [`labeler`] – [`HttpLabelDetector`][labeler::HttpLabelDetector]: HTTP
//!   image-labeling client.
//! - [`llm_driver`] – [`LlmDriver`][llm_driver::LlmDriver]: an
//!   OpenAI-compatible client for text generation and embeddings.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: initialises
//!   the global `tracing` subscriber with an optional OTLP span exporter.

pub mod collaborators;
pub mod fanout;
pub mod labeler;
pub mod llm_driver;
pub mod nasa;
pub mod pipeline;
pub mod retry;
pub mod stages;
pub mod telemetry;

pub use collaborators::{ClockStore, Collaborators};
pub use labeler::HttpLabelDetector;
pub use llm_driver::LlmDriver;
pub use nasa::NasaImagery;
pub use pipeline::{Pipeline, PipelineSettings, TickReport};
pub use retry::CallPolicy;
pub use telemetry::{TracerProviderGuard, init_tracing};
