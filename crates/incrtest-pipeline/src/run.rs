//! Run orchestration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use incrtest_core::exec::{execute_logged, read_excerpt, remove_stale};
use incrtest_core::{
    DiffedUnit, ExecInfo, ExecutedUnit, PipelineError, PoolConfig, Result, RunInfo, UnitFailure,
    UnitSet, WorkerPool,
};

use crate::toolchain::{CoverageTarget, Toolchain};

/// Settings shared by every run task.
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Run logs are written here, next to the binaries.
    pub output_dir: PathBuf,

    /// Flags handed to every test binary.
    pub flags: Vec<String>,

    /// Set when coverage is collected.
    pub coverage_dir: Option<PathBuf>,

    /// Hard wall-clock ceiling per binary.
    pub kill_timeout: Duration,

    pub max_concurrency: usize,
}

/// Result of running one unit's binary.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Passed {
        import_path: String,
        log: PathBuf,
        coverage: Option<PathBuf>,
        execution: ExecInfo,
    },
    Failed {
        import_path: String,
        log: PathBuf,
        reason: String,
        /// `None` when the binary could not be started.
        execution: Option<ExecInfo>,
    },
}

impl RunOutcome {
    pub fn import_path(&self) -> &str {
        match self {
            RunOutcome::Passed { import_path, .. } | RunOutcome::Failed { import_path, .. } => {
                import_path
            }
        }
    }

    /// Wall-clock time of the binary; `None` if it never started.
    pub fn duration_ms(&self) -> Option<u64> {
        match self {
            RunOutcome::Passed { execution, .. } => Some(execution.duration_ms),
            RunOutcome::Failed { execution, .. } => execution.as_ref().map(|e| e.duration_ms),
        }
    }

    pub fn passed(&self) -> bool {
        matches!(self, RunOutcome::Passed { .. })
    }
}

/// Execute one unit's test binary from the unit's source directory.
pub async fn run_unit(toolchain: &dyn Toolchain, settings: &RunSettings, unit: DiffedUnit) -> RunOutcome {
    let hashed = &unit.hashed;
    let import_path = hashed.import_path().to_string();
    let stem = hashed.unit().artifact_stem();
    let log = settings.output_dir.join(format!("{stem}.run.log"));

    let coverage = match &settings.coverage_dir {
        Some(dir) => {
            let target = CoverageTarget::for_stem(dir, &stem);
            let prepared = std::fs::create_dir_all(&target.data_dir)
                .and_then(|()| remove_stale(&target.profile));
            if let Err(e) = prepared {
                return RunOutcome::Failed {
                    import_path,
                    log,
                    reason: format!("cannot prepare coverage for {stem}: {e}"),
                    execution: None,
                };
            }
            Some(target)
        }
        None => None,
    };

    let spec = toolchain.run_command(hashed.unit(), hashed.binary(), &settings.flags, coverage.as_ref());
    match execute_logged(&spec, &log, Some(settings.kill_timeout)).await {
        Ok(exec) if exec.outcome.is_success() => RunOutcome::Passed {
            import_path,
            log,
            coverage: coverage.map(|c| c.profile).filter(|p| p.is_file()),
            execution: exec.info,
        },
        Ok(exec) => RunOutcome::Failed {
            import_path,
            log,
            reason: exec.outcome.describe(),
            execution: Some(exec.info),
        },
        Err(e) => RunOutcome::Failed {
            import_path,
            log,
            reason: e.to_string(),
            execution: None,
        },
    }
}

/// Run every unit marked `should_run`, bounded by `max_concurrency`.
pub async fn run_changed(
    toolchain: Arc<dyn Toolchain>,
    settings: Arc<RunSettings>,
    units: &UnitSet<DiffedUnit>,
) -> Result<Vec<RunOutcome>> {
    let pending: Vec<DiffedUnit> = units.values().filter(|u| u.should_run).cloned().collect();
    info!(
        total = units.len(),
        to_run = pending.len(),
        concurrency = settings.max_concurrency,
        "running test binaries"
    );

    let pool = WorkerPool::new(PoolConfig::new("tests", settings.max_concurrency))?;
    pool.run(
        pending,
        |unit: &DiffedUnit| unit.hashed.import_path().to_string(),
        move |unit| {
            let toolchain = Arc::clone(&toolchain);
            let settings = Arc::clone(&settings);
            async move { run_unit(toolchain.as_ref(), &settings, unit).await }
        },
    )
    .await
}

/// Attach run outcomes to their units.
///
/// Every failing unit is logged with an excerpt of its output, then the
/// stage fails with [`PipelineError::RunFailed`] naming all of them.
pub async fn validate_runs(
    units: UnitSet<DiffedUnit>,
    outcomes: Vec<RunOutcome>,
) -> Result<UnitSet<ExecutedUnit>> {
    let mut failed: Vec<&RunOutcome> = outcomes.iter().filter(|o| !o.passed()).collect();
    failed.sort_by(|a, b| a.import_path().cmp(b.import_path()));

    if !failed.is_empty() {
        let mut failures = Vec::with_capacity(failed.len());
        for outcome in failed {
            let RunOutcome::Failed {
                import_path,
                log,
                reason,
                ..
            } = outcome
            else {
                continue;
            };
            error!(unit = %import_path, log = %log.display(), "tests failed: {reason}");
            match read_excerpt(log).await {
                Ok(text) => info!("Logs: {import_path} ---\n{text}\n-----"),
                Err(e) => warn!(log = %log.display(), error = %e, "run log unreadable"),
            }
            failures.push(UnitFailure {
                import_path: import_path.clone(),
                log: log.clone(),
                reason: reason.clone(),
            });
        }
        return Err(PipelineError::RunFailed { failures });
    }

    let mut runs = std::collections::HashMap::with_capacity(outcomes.len());
    for outcome in outcomes {
        if let RunOutcome::Passed {
            import_path,
            log,
            coverage,
            execution,
        } = outcome
        {
            runs.insert(
                import_path,
                RunInfo {
                    log,
                    coverage,
                    execution,
                },
            );
        }
    }

    let mut executed = UnitSet::new();
    for (import_path, diffed) in units {
        let run = runs.remove(&import_path);
        if diffed.should_run && run.is_none() {
            warn!(unit = %import_path, "unit was due to run but has no result");
        }
        executed.insert_unique(import_path, ExecutedUnit { diffed, run })?;
    }
    for orphan in runs.keys() {
        warn!(unit = %orphan, "run result for an unknown unit ignored");
    }
    Ok(executed)
}
