//! `solmem-memory` – durable state of the rover memory pipeline.
//!
//! Everything that must survive a process restart lives here, on a local
//! SQLite substrate plus a content directory.
//!
//! # Modules
//!
//! - [`clock`] – [`SimulationClock`][clock::SimulationClock]: per-simulation
//!   current earth date, seeded on first reference and advanced with a
//!   compare-and-set.
//! - [`pipeline_log`] – [`PipelineLog`][pipeline_log::PipelineLog]: the
//!   per-date ledger that merges each stage's outcome without touching the
//!   others.
//! - [`vector_index`] – [`VectorIndex`][vector_index::VectorIndex]: memory
//!   embeddings with cosine-similarity recall.
//! - [`content_store`] – [`FsContentStore`][content_store::FsContentStore]:
//!   generated memory text addressed by `content://` locators.

pub mod clock;
pub mod content_store;
pub mod pipeline_log;
pub mod vector_index;
