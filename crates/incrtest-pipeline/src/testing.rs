//! Test doubles: a `sh`-backed toolchain and unit fixtures.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use incrtest_core::{
    CommandSpec, CompileInfo, CompiledUnit, DiffedUnit, ExecInfo, HashedUnit, TestUnit,
};

use crate::toolchain::{CoverageTarget, GoToolchain, Toolchain};

/// What the fake compiler does for a unit.
#[derive(Debug, Clone)]
pub enum FakeUnit {
    /// Writes a test script that prints `output` and exits with `exit_code`.
    Tests { output: String, exit_code: i32 },
    /// Succeeds without writing a binary.
    NoTests,
    /// Fails to compile with exit code 2.
    Broken,
}

/// Compiles units into shell scripts; the "binaries" run through `sh`.
#[derive(Debug, Clone, Default)]
pub struct ShellToolchain {
    pub listing: String,
    pub units: BTreeMap<String, FakeUnit>,
}

impl ShellToolchain {
    pub fn unit(mut self, import_path: &str, dir: &Path, behaviour: FakeUnit) -> Self {
        self.listing.push_str(&format!("{import_path}:{}\n", dir.display()));
        self.units.insert(import_path.to_string(), behaviour);
        self
    }
}

pub fn passing(output: &str) -> FakeUnit {
    FakeUnit::Tests {
        output: output.to_string(),
        exit_code: 0,
    }
}

pub fn failing(output: &str) -> FakeUnit {
    FakeUnit::Tests {
        output: output.to_string(),
        exit_code: 1,
    }
}

impl Toolchain for ShellToolchain {
    fn list_command(&self, dir: &Path) -> CommandSpec {
        CommandSpec::new("sh", dir)
            .args(["-c", "printf '%s' \"$LISTING\""])
            .env("LISTING", &self.listing)
    }

    fn compile_command(
        &self,
        module_dir: &Path,
        unit: &TestUnit,
        binary: &Path,
        _build_flags: &[String],
    ) -> CommandSpec {
        let script = match self.units.get(&unit.import_path) {
            Some(FakeUnit::Tests { output, exit_code }) => format!(
                "echo compiling; printf 'echo %s\\nexit %s\\n' '{output}' {exit_code} > \"$BIN\""
            ),
            Some(FakeUnit::NoTests) => "echo 'no test files'".to_string(),
            Some(FakeUnit::Broken) | None => "echo 'syntax error' 1>&2; exit 2".to_string(),
        };
        CommandSpec::new("sh", module_dir)
            .args(["-c".to_string(), script])
            .env("BIN", binary.to_string_lossy())
    }

    fn coverage_build_flags(&self) -> Vec<String> {
        vec!["-cover".to_string()]
    }

    fn run_flags(&self, _test_timeout: Duration, verbose: bool) -> Vec<String> {
        if verbose {
            vec!["-v".to_string()]
        } else {
            Vec::new()
        }
    }

    fn run_command(
        &self,
        unit: &TestUnit,
        binary: &Path,
        run_flags: &[String],
        coverage: Option<&CoverageTarget>,
    ) -> CommandSpec {
        let mut spec = CommandSpec::new("sh", &unit.directory)
            .args([binary.to_string_lossy().into_owned()])
            .args(run_flags.iter().cloned());
        if let Some(target) = coverage {
            spec = spec.env("COVERDIR", target.data_dir.to_string_lossy());
        }
        spec
    }

    fn is_test_source(&self, file: &Path) -> bool {
        GoToolchain::new().is_test_source(file)
    }

    fn has_build_tag(&self, file: &Path, contents: &str, tag: &str) -> bool {
        GoToolchain::new().has_build_tag(file, contents, tag)
    }
}

/// A hashed unit whose artifacts live under `/build`.
pub fn hashed(import_path: &str, hash: &str) -> HashedUnit {
    let unit = TestUnit::new(import_path, format!("/src/{import_path}"));
    let stem = unit.artifact_stem();
    HashedUnit {
        compiled: CompiledUnit {
            compile: CompileInfo {
                binary: PathBuf::from(format!("/build/{stem}")),
                log: PathBuf::from(format!("/build/{stem}.compile.log")),
                execution: exec_info(10),
            },
            unit,
        },
        hash: hash.to_string(),
    }
}

pub fn diffed(import_path: &str, should_run: bool) -> DiffedUnit {
    DiffedUnit {
        hashed: hashed(import_path, "h"),
        index_hash: None,
        should_run,
    }
}

pub fn exec_info(duration_ms: u64) -> ExecInfo {
    ExecInfo {
        command: "true".to_string(),
        exit_code: 0,
        cwd: PathBuf::from("/src"),
        duration_ms,
    }
}
