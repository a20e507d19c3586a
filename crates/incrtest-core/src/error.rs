//! Error taxonomy for the test pipeline.

use std::fmt::Write as _;
use std::path::PathBuf;

/// A single unit that failed to compile or run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFailure {
    /// Import path of the failing unit.
    pub import_path: String,

    /// Log file holding the full compiler or test output.
    pub log: PathBuf,

    /// Short reason (exit code, timeout, spawn error).
    pub reason: String,
}

/// Errors raised by the index backing store.
#[derive(Debug, thiserror::Error)]
pub enum IndexStoreError {
    #[error("index for suite '{suite}' changed since it was loaded (expected revision {expected:?}, found {actual:?})")]
    Conflict {
        suite: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    #[error("index io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("unit discovery failed running `{command}`: {reason}")]
    Discovery { command: String, reason: String },

    #[error("{} unit(s) failed to compile:\n{}", .failures.len(), render_failures(.failures))]
    CompileFailed {
        failures: Vec<UnitFailure>,
        /// Units that compiled fine while others failed.
        succeeded: Vec<String>,
    },

    #[error("{} unit(s) failed to run:\n{}", .failures.len(), render_failures(.failures))]
    RunFailed { failures: Vec<UnitFailure> },

    #[error("no state file for stage '{stage}' at {}; did the previous stage complete?", .path.display())]
    MissingStageState { stage: String, path: PathBuf },

    #[error("stage file {} is not usable: {reason}", .path.display())]
    StageSchema { path: PathBuf, reason: String },

    #[error("stage files belong to different pipelines: {expected} vs {actual}")]
    StageLineage { expected: String, actual: String },

    #[error("duplicate unit: {0}")]
    DuplicateUnit(String),

    #[error("failed to hash {}: {source}", .path.display())]
    Hash {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker task panicked: {0}")]
    WorkerPanicked(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("index store error: {0}")]
    IndexStore(#[from] IndexStoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

fn render_failures(failures: &[UnitFailure]) -> String {
    let mut out = String::new();
    for (i, failure) in failures.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let _ = write!(
            out,
            "  - {} ({}; log: {})",
            failure.import_path,
            failure.reason,
            failure.log.display()
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(path: &str) -> UnitFailure {
        UnitFailure {
            import_path: path.to_string(),
            log: PathBuf::from(format!("/build/{}.compile.log", path.replace('/', "-"))),
            reason: "exit code 2".to_string(),
        }
    }

    #[test]
    fn compile_failure_names_every_unit() {
        let err = PipelineError::CompileFailed {
            failures: vec![failure("example.com/a"), failure("example.com/b")],
            succeeded: vec!["example.com/c".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("2 unit(s) failed to compile"));
        assert!(msg.contains("example.com/a (exit code 2; log: /build/example.com-a.compile.log)"));
        assert!(msg.contains("example.com/b"));
        assert!(!msg.contains("example.com/c"));
    }

    #[test]
    fn missing_stage_state_mentions_stage_and_path() {
        let err = PipelineError::MissingStageState {
            stage: "build".to_string(),
            path: PathBuf::from("/tmp/steps/build.json"),
        };
        let msg = err.to_string();
        assert!(msg.contains("'build'"));
        assert!(msg.contains("/tmp/steps/build.json"));
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: PipelineError = io.into();
        assert!(matches!(err, PipelineError::Io(_)));
    }

    #[test]
    fn conflict_converts_into_pipeline_error() {
        let conflict = IndexStoreError::Conflict {
            suite: "unit".to_string(),
            expected: Some("aaa".to_string()),
            actual: Some("bbb".to_string()),
        };
        let err: PipelineError = conflict.into();
        assert!(err.to_string().contains("changed since it was loaded"));
    }
}
