// src/config/loader.rs

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::config::model::{EngineConfig, PipelineFile, RawEngineConfig, RawPipelineFile};
use crate::errors::Result;

/// Load an engine config file and return the raw `RawEngineConfig`.
///
/// This only performs TOML deserialization; use [`load_and_validate`] for
/// semantic checks.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawEngineConfig> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawEngineConfig = toml::from_str(&contents)?;

    Ok(config)
}

/// Load and validate the engine config.
///
/// A missing file is not an error: the engine then runs on defaults (an
/// in-process backend), which is what single-shot CLI runs want.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<EngineConfig> {
    let path = path.as_ref();
    if !path.exists() {
        debug!(path = ?path, "engine config not found; using defaults");
        return Ok(EngineConfig::default());
    }

    let raw_config = load_from_path(path)?;
    let config = EngineConfig::try_from(raw_config)?;
    Ok(config)
}

/// Load a pipeline definition and validate its job graph.
pub fn load_pipeline(path: impl AsRef<Path>) -> Result<PipelineFile> {
    let contents = fs::read_to_string(path.as_ref())?;
    let raw: RawPipelineFile = toml::from_str(&contents)?;
    PipelineFile::try_from(raw)
}
