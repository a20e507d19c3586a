//! Compiler orchestration.
//!
//! Every discovered unit is compiled in the bounded worker pool. A unit that
//! fails never cancels the others; failures are collected and reported
//! together once the pool drains.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, warn};

use incrtest_core::exec::{execute_logged, read_excerpt, remove_stale};
use incrtest_core::{
    CompileInfo, CompiledUnit, ExecInfo, PipelineError, PoolConfig, Result, TestUnit,
    UnitFailure, UnitSet, WorkerPool,
};

use crate::toolchain::Toolchain;

/// Settings shared by every compile task.
#[derive(Debug, Clone)]
pub struct CompileSettings {
    pub module_dir: PathBuf,

    /// Binaries and compile logs are written here.
    pub output_dir: PathBuf,

    /// Build flags, coverage instrumentation included.
    pub flags: Vec<String>,

    pub max_concurrency: usize,
}

/// Result of compiling one unit.
#[derive(Debug, Clone)]
pub enum CompileOutcome {
    Built {
        unit: TestUnit,
        binary: PathBuf,
        log: PathBuf,
        execution: ExecInfo,
    },
    /// The compiler succeeded but produced nothing: the unit has no tests.
    NoTests {
        unit: TestUnit,
        log: PathBuf,
        execution: ExecInfo,
    },
    Failed {
        unit: TestUnit,
        log: PathBuf,
        reason: String,
    },
}

impl CompileOutcome {
    pub fn import_path(&self) -> &str {
        match self {
            CompileOutcome::Built { unit, .. }
            | CompileOutcome::NoTests { unit, .. }
            | CompileOutcome::Failed { unit, .. } => &unit.import_path,
        }
    }
}

/// Compile a single unit into `<output>/<stem>` with its log beside it.
pub async fn compile_unit(
    toolchain: &dyn Toolchain,
    settings: &CompileSettings,
    unit: TestUnit,
) -> CompileOutcome {
    let stem = unit.artifact_stem();
    let binary = settings.output_dir.join(&stem);
    let log = settings.output_dir.join(format!("{stem}.compile.log"));
    let spec = toolchain.compile_command(&settings.module_dir, &unit, &binary, &settings.flags);

    // The build dir is reused across pipelines.
    if let Err(e) = remove_stale(&binary) {
        return CompileOutcome::Failed {
            unit,
            log,
            reason: format!("cannot remove stale {}: {e}", binary.display()),
        };
    }

    match execute_logged(&spec, &log, None).await {
        Ok(exec) if exec.outcome.is_success() => {
            if binary.is_file() {
                CompileOutcome::Built {
                    unit,
                    binary,
                    log,
                    execution: exec.info,
                }
            } else {
                CompileOutcome::NoTests {
                    unit,
                    log,
                    execution: exec.info,
                }
            }
        }
        Ok(exec) => CompileOutcome::Failed {
            unit,
            log,
            reason: exec.outcome.describe(),
        },
        Err(e) => CompileOutcome::Failed {
            unit,
            log,
            reason: e.to_string(),
        },
    }
}

/// Compile every unit with at most `max_concurrency` compilers running.
pub async fn compile_all(
    toolchain: Arc<dyn Toolchain>,
    settings: Arc<CompileSettings>,
    units: UnitSet<TestUnit>,
) -> Result<Vec<CompileOutcome>> {
    let pool = WorkerPool::new(PoolConfig::new("builds", settings.max_concurrency))?;
    info!(
        units = units.len(),
        concurrency = settings.max_concurrency,
        "compiling test binaries"
    );

    pool.run(
        units.into_values().collect(),
        |unit: &TestUnit| unit.import_path.clone(),
        move |unit| {
            let toolchain = Arc::clone(&toolchain);
            let settings = Arc::clone(&settings);
            async move { compile_unit(toolchain.as_ref(), &settings, unit).await }
        },
    )
    .await
}

/// Report compile outcomes and keep the units that produced a binary.
///
/// Any failure is fatal for the stage: every failing unit is named in the
/// returned [`PipelineError::CompileFailed`].
pub async fn validate_compilation(
    output_dir: &Path,
    mut outcomes: Vec<CompileOutcome>,
) -> Result<UnitSet<CompiledUnit>> {
    outcomes.sort_by(|a, b| a.import_path().cmp(b.import_path()));

    let mut failures = Vec::new();
    let mut succeeded = Vec::new();
    for outcome in &outcomes {
        match outcome {
            CompileOutcome::Built { unit, .. } => {
                info!("ok  \t{}\t[build successful]", unit.import_path);
                succeeded.push(unit.import_path.clone());
            }
            CompileOutcome::NoTests { unit, .. } => {
                info!("ok  \t{}\t[no test files]", unit.import_path);
                succeeded.push(unit.import_path.clone());
            }
            CompileOutcome::Failed { unit, log, reason } => {
                error!("FAIL\t{}\t[build failed]", unit.import_path);
                match read_excerpt(log).await {
                    Ok(text) => info!("compile output for {}:\n{text}", unit.import_path),
                    Err(e) => warn!(log = %log.display(), error = %e, "compile log unreadable"),
                }
                failures.push(UnitFailure {
                    import_path: unit.import_path.clone(),
                    log: log.clone(),
                    reason: reason.clone(),
                });
            }
        }
    }

    if !failures.is_empty() {
        return Err(PipelineError::CompileFailed {
            failures,
            succeeded,
        });
    }

    let mut compiled = UnitSet::new();
    for outcome in outcomes {
        let CompileOutcome::Built {
            unit,
            binary,
            log,
            execution,
        } = outcome
        else {
            continue;
        };
        if !binary.is_file() {
            warn!(unit = %unit.import_path, binary = %binary.display(), "binary disappeared after compiling");
            continue;
        }
        compiled.insert_unique(
            unit.import_path.clone(),
            CompiledUnit {
                unit,
                compile: CompileInfo {
                    binary,
                    log,
                    execution,
                },
            },
        )?;
    }

    let on_disk = count_binaries(output_dir)?;
    if on_disk != compiled.len() {
        warn!(
            on_disk,
            compiled = compiled.len(),
            dir = %output_dir.display(),
            "test binary count does not match compiled units"
        );
    }
    Ok(compiled)
}

fn count_binaries(dir: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() && entry.file_name().to_string_lossy().ends_with("-test") {
            count += 1;
        }
    }
    Ok(count)
}
