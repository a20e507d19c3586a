//! Stage state files.
//!
//! Build, run and update can execute as separate processes. Each stage writes
//! its unit map to `<steps>/<stage>.json` and the next stage reads it back.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::unit::{ExecutedUnit, HashedUnit, UnitSet};

/// Current stage file schema version.
pub const STAGE_SCHEMA_VERSION: u32 = 1;

/// Stages that persist state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Build,
    Run,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Build => "build",
            Stage::Run => "run",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Versioned envelope around a stage's unit map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageFile<T> {
    pub schema_version: u32,
    pub stage: Stage,

    /// Shared by every stage file produced for one pipeline.
    pub pipeline_id: Uuid,

    pub written_at: DateTime<Utc>,

    /// Hash index revision the run stage compared against. The update stage
    /// publishes on top of it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_revision: Option<String>,

    pub units: UnitSet<T>,
}

impl<T> StageFile<T> {
    pub fn new(stage: Stage, pipeline_id: Uuid, units: UnitSet<T>) -> Self {
        Self {
            schema_version: STAGE_SCHEMA_VERSION,
            stage,
            pipeline_id,
            written_at: Utc::now(),
            index_revision: None,
            units,
        }
    }

    pub fn with_index_revision(mut self, revision: Option<String>) -> Self {
        self.index_revision = revision;
        self
    }
}

/// State produced by the build stage.
pub type BuildState = StageFile<HashedUnit>;

/// State produced by the run stage.
pub type RunState = StageFile<ExecutedUnit>;

/// Reads and writes stage files under a steps directory.
pub struct StageStore {
    dir: PathBuf,
}

impl StageStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path(&self, stage: Stage) -> PathBuf {
        self.dir.join(format!("{}.json", stage.name()))
    }

    pub fn persist<T: Serialize>(&self, state: &StageFile<T>) -> Result<PathBuf> {
        let path = self.path(state.stage);
        debug!(path = %path.display(), "writing stage state");

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer(&mut tmp, state)?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(path)
    }

    /// Load a stage's state. A missing file is fatal: the stage never completed.
    pub fn load<T: DeserializeOwned>(&self, stage: Stage) -> Result<StageFile<T>> {
        let path = self.path(stage);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::MissingStageState {
                    stage: stage.name().to_string(),
                    path,
                })
            }
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), "loading stage state");

        let state: StageFile<T> =
            serde_json::from_slice(&bytes).map_err(|e| PipelineError::StageSchema {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        if state.schema_version != STAGE_SCHEMA_VERSION {
            return Err(PipelineError::StageSchema {
                path,
                reason: format!(
                    "schema version {} (expected {})",
                    state.schema_version, STAGE_SCHEMA_VERSION
                ),
            });
        }
        if state.stage != stage {
            return Err(PipelineError::StageSchema {
                path,
                reason: format!("holds '{}' state (expected '{}')", state.stage, stage),
            });
        }
        Ok(state)
    }
}
