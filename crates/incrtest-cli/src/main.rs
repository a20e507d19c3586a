//! incrtest - incremental test build-and-run pipeline
//!
//! ## Commands
//!
//! - `build`: discover test units, compile them and hash the binaries
//! - `run`: run the units whose binary changed since the published index
//! - `update`: publish the run's digests as the new index
//! - `e2e`: all three in one invocation

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, Level};

use incrtest_core::git::{branch_from_ref, current_branch};
use incrtest_core::telemetry::init_tracing;
use incrtest_core::FsIndexStore;
use incrtest_pipeline::{GoToolchain, Pipeline, PipelineConfig, PipelineStep};

#[derive(Parser)]
#[command(name = "incrtest")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Incremental test build-and-run pipeline", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true, env = "INCRTEST_VERBOSE")]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true, env = "INCRTEST_JSON")]
    json: bool,

    #[command(flatten)]
    pipeline: PipelineArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Discover, compile and hash test units
    Build,

    /// Run test units whose binary changed
    Run,

    /// Publish the hash index from the last run
    Update,

    /// Build, run and update in one go
    E2e,
}

impl Commands {
    fn step(self) -> PipelineStep {
        match self {
            Commands::Build => PipelineStep::Build,
            Commands::Run => PipelineStep::Run,
            Commands::Update => PipelineStep::Update,
            Commands::E2e => PipelineStep::E2e,
        }
    }
}

#[derive(Args, Debug)]
struct PipelineArgs {
    /// Root of the module under test
    #[arg(long, global = true, env = "INCRTEST_MODULE_DIR", default_value = ".")]
    module_dir: PathBuf,

    /// Extra compiler flags, whitespace separated
    #[arg(long, global = true, env = "INCRTEST_BUILD_FLAGS", allow_hyphen_values = true)]
    build_flags: Option<String>,

    /// Test suite name; each suite keeps its own hash index
    #[arg(long, global = true, env = "INCRTEST_TEST_SUITE", default_value = "default")]
    test_suite: String,

    /// Output directory for binaries, logs and stage files
    /// (default: $RUNNER_TEMP, else <tmp>/incrtest/<suite>)
    #[arg(long, global = true, env = "INCRTEST_BUILD_DIR")]
    build_dir: Option<PathBuf>,

    /// Hash index directory (default: <module-dir>/.incrtest/index)
    #[arg(long, global = true, env = "INCRTEST_INDEX_DIR")]
    index_dir: Option<PathBuf>,

    /// Concurrent compilations (default: logical CPUs)
    #[arg(long, global = true, env = "INCRTEST_BUILD_CONCURRENCY")]
    build_concurrency: Option<usize>,

    /// Concurrent test binaries (default: logical CPUs)
    #[arg(long, global = true, env = "INCRTEST_RUN_CONCURRENCY")]
    run_concurrency: Option<usize>,

    /// Run every unit regardless of the index
    #[arg(long, global = true, env = "INCRTEST_RUN_ALL_TESTS")]
    run_all_tests: bool,

    /// Publish the index even off the default branch
    #[arg(long, global = true, env = "INCRTEST_FORCE_UPDATE_INDEX")]
    force_update_index: bool,

    /// Instrument binaries and collect coverage profiles
    #[arg(long, global = true, env = "INCRTEST_COLLECT_COVERAGE")]
    collect_coverage: bool,

    /// Only units with test sources carrying this build tag
    #[arg(long, global = true, env = "INCRTEST_TAG_FILTER")]
    tag_filter: Option<String>,

    /// Per-binary test timeout in seconds
    #[arg(long, global = true, env = "INCRTEST_TEST_TIMEOUT_SECS", default_value_t = 600)]
    test_timeout_secs: u64,

    /// Branch being tested (default: git HEAD of the module)
    #[arg(long, global = true, env = "GITHUB_REF_NAME")]
    current_branch: Option<String>,

    /// Branch allowed to publish the index
    #[arg(long, global = true, env = "INCRTEST_DEFAULT_BRANCH")]
    default_branch: Option<String>,
}

impl PipelineArgs {
    fn into_config(self, verbose: bool) -> Result<PipelineConfig> {
        let module_dir = self
            .module_dir
            .canonicalize()
            .with_context(|| format!("Module directory {} not found", self.module_dir.display()))?;

        let mut config = PipelineConfig::new(&module_dir, self.test_suite);
        if let Some(dir) = self.build_dir {
            config.build_dir = dir;
        }
        if let Some(dir) = self.index_dir {
            config.index_dir = dir;
        }
        if let Some(n) = self.build_concurrency {
            config.build_concurrency = n;
        }
        if let Some(n) = self.run_concurrency {
            config.run_concurrency = n;
        }
        config.build_flags = self
            .build_flags
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        config.tag_filter = self.tag_filter.filter(|t| !t.trim().is_empty());
        config.run_all_tests = self.run_all_tests;
        config.force_update_index = self.force_update_index;
        config.collect_coverage = self.collect_coverage;
        config.test_timeout = Duration::from_secs(self.test_timeout_secs);
        config.current_branch = self
            .current_branch
            .as_deref()
            .map(branch_from_ref)
            .filter(|b| !b.is_empty())
            .map(str::to_string)
            .or_else(|| current_branch(&module_dir));
        config.default_branch = self.default_branch.filter(|b| !b.is_empty());
        config.verbose = verbose;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let step = cli.command.step();
    let config = cli.pipeline.into_config(cli.verbose)?;
    let index_store = FsIndexStore::new(&config.index_dir).with_context(|| {
        format!("Failed to open index directory {}", config.index_dir.display())
    })?;
    let pipeline = Pipeline::new(config, Arc::new(GoToolchain::new()), Arc::new(index_store))
        .context("Invalid pipeline configuration")?;

    pipeline
        .execute(step)
        .await
        .with_context(|| format!("{} step failed", step.name()))?;
    info!(step = step.name(), "step completed");

    // Lingering subprocess handles must not keep the process alive once the
    // index is published.
    if matches!(step, PipelineStep::Update | PipelineStep::E2e) {
        std::process::exit(0);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn options_after_subcommand() {
        let dir = tempfile_dir();
        let cli = Cli::try_parse_from([
            "incrtest",
            "run",
            "--module-dir",
            dir.as_str(),
            "--test-suite",
            "integration",
            "--build-flags",
            "-race -count=1",
            "--run-concurrency",
            "3",
            "--current-branch",
            "refs/heads/main",
            "--default-branch",
            "main",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Run));

        let config = cli.pipeline.into_config(false).unwrap();
        assert_eq!(config.test_suite, "integration");
        assert_eq!(config.build_flags, vec!["-race", "-count=1"]);
        assert_eq!(config.run_concurrency, 3);
        assert_eq!(config.current_branch.as_deref(), Some("main"));
        assert_eq!(config.default_branch.as_deref(), Some("main"));
        assert_eq!(config.test_timeout, Duration::from_secs(600));
    }

    #[test]
    fn verbose_is_carried_into_config() {
        let dir = tempfile_dir();
        let cli = Cli::try_parse_from(["incrtest", "-v", "e2e", "--module-dir", dir.as_str()])
            .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.command.step(), PipelineStep::E2e);
        assert!(cli.pipeline.into_config(cli.verbose).unwrap().verbose);
    }

    #[test]
    fn missing_module_dir_is_an_error() {
        let cli = Cli::try_parse_from([
            "incrtest",
            "build",
            "--module-dir",
            "/definitely/not/here",
        ])
        .unwrap();
        assert!(cli.pipeline.into_config(false).is_err());
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["incrtest"]).is_err());
    }

    fn tempfile_dir() -> String {
        std::env::temp_dir().to_string_lossy().into_owned()
    }
}
