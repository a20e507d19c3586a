//! The compiler toolchain seam.
//!
//! Everything language specific (how units are listed, how a test binary is
//! built and how it is invoked) lives behind [`Toolchain`]. The orchestrators
//! only deal in [`CommandSpec`]s and files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use incrtest_core::{CommandSpec, TestUnit};

/// Where a run writes its coverage data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageTarget {
    /// Scratch directory for raw counters, one per unit.
    pub data_dir: PathBuf,

    /// Final text profile.
    pub profile: PathBuf,
}

impl CoverageTarget {
    /// Coverage paths for the binary `stem` under `coverage_dir`.
    pub fn for_stem(coverage_dir: &Path, stem: &str) -> Self {
        Self {
            data_dir: coverage_dir.join(format!("go-cover-{stem}")),
            profile: coverage_dir.join(format!("{stem}.cover.out")),
        }
    }
}

pub trait Toolchain: Send + Sync {
    /// Command that prints one `import_path:directory` line per unit found
    /// below `dir`.
    fn list_command(&self, dir: &Path) -> CommandSpec;

    /// Command that compiles `unit` into `binary`, run from `module_dir`.
    ///
    /// Exiting zero without producing `binary` means the unit has no tests.
    fn compile_command(
        &self,
        module_dir: &Path,
        unit: &TestUnit,
        binary: &Path,
        build_flags: &[String],
    ) -> CommandSpec;

    /// Extra build flags that instrument binaries for coverage.
    fn coverage_build_flags(&self) -> Vec<String>;

    /// Flags handed to every test binary.
    fn run_flags(&self, test_timeout: Duration, verbose: bool) -> Vec<String>;

    /// Command that executes a compiled test binary from the unit's directory.
    fn run_command(
        &self,
        unit: &TestUnit,
        binary: &Path,
        run_flags: &[String],
        coverage: Option<&CoverageTarget>,
    ) -> CommandSpec;

    /// Whether `file` can hold tests, judged by its name alone.
    fn is_test_source(&self, file: &Path) -> bool;

    /// Whether `file` is a test source carrying the build constraint `tag`.
    fn has_build_tag(&self, file: &Path, contents: &str, tag: &str) -> bool;

    /// Parse the output of [`Toolchain::list_command`].
    fn parse_listing(&self, stdout: &str) -> Result<Vec<TestUnit>, String> {
        stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| match line.split_once(':') {
                Some((import_path, dir)) if !import_path.is_empty() && !dir.is_empty() => {
                    Ok(TestUnit::new(import_path, dir))
                }
                _ => Err(format!("malformed listing line: {line:?}")),
            })
            .collect()
    }
}

/// The `go` command line.
#[derive(Debug, Clone)]
pub struct GoToolchain {
    program: String,
}

impl Default for GoToolchain {
    fn default() -> Self {
        Self {
            program: "go".to_string(),
        }
    }
}

impl GoToolchain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific `go` executable.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Toolchain for GoToolchain {
    fn list_command(&self, dir: &Path) -> CommandSpec {
        CommandSpec::new(&self.program, dir).args(["list", "-f", "{{.ImportPath}}:{{.Dir}}", "./..."])
    }

    fn compile_command(
        &self,
        module_dir: &Path,
        unit: &TestUnit,
        binary: &Path,
        build_flags: &[String],
    ) -> CommandSpec {
        CommandSpec::new(&self.program, module_dir)
            .args(["test", "-c", "-o"])
            .args([binary.to_string_lossy().into_owned()])
            .args(build_flags.iter().cloned())
            .args([unit.import_path.clone()])
    }

    fn coverage_build_flags(&self) -> Vec<String> {
        vec![
            "-cover".to_string(),
            "-coverpkg=./...".to_string(),
            "-covermode=atomic".to_string(),
        ]
    }

    fn run_flags(&self, test_timeout: Duration, verbose: bool) -> Vec<String> {
        let mut flags = vec![format!("-test.timeout={}s", test_timeout.as_secs())];
        if verbose {
            flags.push("-test.v".to_string());
        }
        flags
    }

    fn run_command(
        &self,
        unit: &TestUnit,
        binary: &Path,
        run_flags: &[String],
        coverage: Option<&CoverageTarget>,
    ) -> CommandSpec {
        let mut spec = CommandSpec::new(binary.to_string_lossy(), &unit.directory)
            .args(run_flags.iter().cloned());
        if let Some(target) = coverage {
            spec = spec
                .args([format!("-test.coverprofile={}", target.profile.display())])
                .env("GOCOVERDIR", target.data_dir.to_string_lossy());
        }
        spec
    }

    fn is_test_source(&self, file: &Path) -> bool {
        file.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with("_test.go"))
    }

    fn has_build_tag(&self, file: &Path, contents: &str, tag: &str) -> bool {
        self.is_test_source(file) && contents.contains(&format!("//go:build {tag}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn go_list_command() {
        let spec = GoToolchain::new().list_command(Path::new("/src"));
        assert_eq!(spec.display(), "go list -f {{.ImportPath}}:{{.Dir}} ./...");
        assert_eq!(spec.cwd, PathBuf::from("/src"));
    }

    #[test]
    fn go_compile_command_orders_flags_before_package() {
        let unit = TestUnit::new("example.com/m/store", "/src/store");
        let spec = GoToolchain::new().compile_command(
            Path::new("/src"),
            &unit,
            Path::new("/build/example.com-m-store-test"),
            &["-race".to_string()],
        );
        assert_eq!(
            spec.display(),
            "go test -c -o /build/example.com-m-store-test -race example.com/m/store"
        );
        assert_eq!(spec.cwd, PathBuf::from("/src"));
    }

    #[test]
    fn go_run_command_uses_unit_directory() {
        let unit = TestUnit::new("example.com/m/store", "/src/store");
        let go = GoToolchain::new();
        let flags = go.run_flags(Duration::from_secs(600), true);
        let spec = go.run_command(&unit, Path::new("/build/x-test"), &flags, None);

        assert_eq!(spec.display(), "/build/x-test -test.timeout=600s -test.v");
        assert_eq!(spec.cwd, PathBuf::from("/src/store"));
        assert!(spec.env.is_empty());
    }

    #[test]
    fn go_run_command_with_coverage() {
        let unit = TestUnit::new("m/a", "/src/a");
        let target = CoverageTarget::for_stem(Path::new("/cov"), "m-a-test");
        let spec = GoToolchain::new().run_command(&unit, Path::new("/b/m-a-test"), &[], Some(&target));

        assert_eq!(spec.args, vec!["-test.coverprofile=/cov/m-a-test.cover.out"]);
        assert_eq!(
            spec.env,
            vec![("GOCOVERDIR".to_string(), "/cov/go-cover-m-a-test".to_string())]
        );
    }

    #[test]
    fn quiet_run_flags_only_carry_timeout() {
        assert_eq!(
            GoToolchain::new().run_flags(Duration::from_secs(90), false),
            vec!["-test.timeout=90s"]
        );
    }

    #[test]
    fn build_tag_needs_test_source() {
        let go = GoToolchain::new();
        let src = "//go:build integration\n\npackage store\n";
        assert!(go.has_build_tag(Path::new("store/db_test.go"), src, "integration"));
        assert!(!go.has_build_tag(Path::new("store/db.go"), src, "integration"));
        assert!(!go.has_build_tag(Path::new("store/db_test.go"), src, "e2e"));
    }

    #[test]
    fn listing_parses_and_splits_on_first_colon() {
        let units = GoToolchain::new()
            .parse_listing("example.com/a:/src/a\n\nexample.com/b:C:/src/b\n")
            .unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0], TestUnit::new("example.com/a", "/src/a"));
        assert_eq!(units[1].directory, PathBuf::from("C:/src/b"));
    }

    #[test]
    fn malformed_listing_is_rejected() {
        let err = GoToolchain::new().parse_listing("example.com/a\n").unwrap_err();
        assert!(err.contains("example.com/a"));
    }
}
