//! Typed pipeline configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use incrtest_core::{PipelineError, Result};

/// Grace added on top of the test binary's own timeout before it is killed.
pub const KILL_GRACE: Duration = Duration::from_secs(60);

pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Pipeline step to execute.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    /// Discover, compile and hash.
    Build,
    /// Compare against the index and run changed units.
    Run,
    /// Publish the new index.
    Update,
    /// All of the above in one process.
    E2e,
}

impl PipelineStep {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineStep::Build => "build",
            PipelineStep::Run => "run",
            PipelineStep::Update => "update",
            PipelineStep::E2e => "e2e",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Root of the source tree.
    pub module_dir: PathBuf,

    /// Binaries, logs, stage files and coverage land here.
    pub build_dir: PathBuf,

    /// Directory holding one `<suite>.json` hash index per suite.
    pub index_dir: PathBuf,

    pub build_flags: Vec<String>,

    /// Namespaces the hash index.
    pub test_suite: String,

    /// Only build units with test sources carrying this build tag.
    pub tag_filter: Option<String>,

    pub build_concurrency: usize,
    pub run_concurrency: usize,

    pub run_all_tests: bool,
    pub force_update_index: bool,
    pub collect_coverage: bool,

    /// Passed to test binaries; the kill ceiling adds [`KILL_GRACE`].
    pub test_timeout: Duration,

    pub current_branch: Option<String>,
    pub default_branch: Option<String>,

    /// Adds verbose flags to test runs.
    pub verbose: bool,
}

impl PipelineConfig {
    /// Configuration with defaults for everything but the module and suite.
    pub fn new(module_dir: impl Into<PathBuf>, test_suite: impl Into<String>) -> Self {
        let module_dir = module_dir.into();
        let test_suite = test_suite.into();
        let cpus = num_cpus::get();
        Self {
            build_dir: default_build_dir(&test_suite),
            index_dir: default_index_dir(&module_dir),
            module_dir,
            build_flags: Vec::new(),
            test_suite,
            tag_filter: None,
            build_concurrency: cpus,
            run_concurrency: cpus,
            run_all_tests: false,
            force_update_index: false,
            collect_coverage: false,
            test_timeout: DEFAULT_TEST_TIMEOUT,
            current_branch: None,
            default_branch: None,
            verbose: false,
        }
    }

    /// Check the configuration and prepare the build directory.
    ///
    /// Coverage needs every unit to execute, so it forces `run_all_tests`.
    pub fn validate(mut self) -> Result<Self> {
        if self.test_suite.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "test suite name must not be empty".to_string(),
            ));
        }
        if self.test_suite.contains(['/', '\\']) {
            return Err(PipelineError::InvalidConfig(format!(
                "test suite name '{}' must not contain path separators",
                self.test_suite
            )));
        }
        if self.build_concurrency == 0 || self.run_concurrency == 0 {
            return Err(PipelineError::InvalidConfig(
                "build and run concurrency must be at least 1".to_string(),
            ));
        }
        if !self.module_dir.is_dir() {
            return Err(PipelineError::InvalidConfig(format!(
                "module directory {} does not exist",
                self.module_dir.display()
            )));
        }

        if self.collect_coverage && !self.run_all_tests {
            info!("coverage collection enabled, running all tests");
            self.run_all_tests = true;
        }

        std::fs::create_dir_all(self.steps_dir())?;
        std::fs::create_dir_all(self.coverage_dir())?;
        Ok(self)
    }

    pub fn steps_dir(&self) -> PathBuf {
        self.build_dir.join("steps")
    }

    pub fn coverage_dir(&self) -> PathBuf {
        self.build_dir.join("coverage")
    }

    /// Wall-clock ceiling after which a test binary is killed.
    pub fn kill_timeout(&self) -> Duration {
        self.test_timeout + KILL_GRACE
    }
}

/// `$RUNNER_TEMP` when set, else `<tmp>/incrtest/<suite>`.
pub fn default_build_dir(test_suite: &str) -> PathBuf {
    match std::env::var_os("RUNNER_TEMP") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => std::env::temp_dir().join("incrtest").join(test_suite),
    }
}

pub fn default_index_dir(module_dir: &Path) -> PathBuf {
    module_dir.join(".incrtest").join("index")
}
