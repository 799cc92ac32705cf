// src/config/mod.rs

//! Configuration loading and validation for pipedag.
//!
//! Responsibilities:
//! - Define the TOML-backed data model for the engine config and for
//!   pipeline files (`model.rs`).
//! - Load files from disk (`loader.rs`).
//! - Validate invariants, including job-graph correctness (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path, load_pipeline};
pub use model::{
    BackendSection, EngineConfig, GovernorSection, JobEntry, LockSection, OrchestratorSection,
    PipelineFile, QueueSection, RawEngineConfig, RawPipelineFile, StateSection,
};
