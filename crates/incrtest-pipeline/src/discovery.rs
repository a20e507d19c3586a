//! Unit discovery.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use walkdir::{DirEntry, WalkDir};

use incrtest_core::exec::capture_stdout;
use incrtest_core::{PipelineError, Result, TestUnit, UnitSet};

use crate::toolchain::Toolchain;

/// Directories never searched for tagged test sources.
const SKIPPED_DIRS: &[&str] = &["vendor", "testdata", "node_modules"];

/// List every unit below `module_dir`, or only those with test sources
/// carrying `tag_filter` when one is given.
pub async fn discover_units(
    toolchain: &dyn Toolchain,
    module_dir: &Path,
    tag_filter: Option<&str>,
) -> Result<UnitSet<TestUnit>> {
    let Some(tag) = tag_filter else {
        return list_units(toolchain, module_dir).await;
    };

    let dirs = tagged_test_dirs(toolchain, module_dir, tag)?;
    info!(tag, dirs = dirs.len(), "directories with tagged test sources");

    let mut units: UnitSet<TestUnit> = UnitSet::new();
    for dir in dirs {
        for (import_path, unit) in list_units(toolchain, &dir).await? {
            if let Some(existing) = units.get(&import_path) {
                warn!(
                    unit = %import_path,
                    kept = %existing.directory.display(),
                    ignored = %unit.directory.display(),
                    "unit listed by more than one tagged directory, keeping the first entry"
                );
                continue;
            }
            units.insert_unique(import_path, unit)?;
        }
    }
    Ok(units)
}

/// Run the toolchain's listing command in `dir` and parse its output.
///
/// A unit listed twice keeps its first entry.
pub async fn list_units(toolchain: &dyn Toolchain, dir: &Path) -> Result<UnitSet<TestUnit>> {
    let spec = toolchain.list_command(dir);
    let (outcome, stdout, stderr) = capture_stdout(&spec).await?;
    if !outcome.is_success() {
        return Err(PipelineError::Discovery {
            command: spec.display(),
            reason: format!("{}: {}", outcome.describe(), stderr.trim()),
        });
    }

    let listed = toolchain
        .parse_listing(&stdout)
        .map_err(|reason| PipelineError::Discovery {
            command: spec.display(),
            reason,
        })?;

    let mut units: UnitSet<TestUnit> = UnitSet::new();
    for unit in listed {
        if let Some(existing) = units.get(&unit.import_path) {
            warn!(
                unit = %unit.import_path,
                kept = %existing.directory.display(),
                ignored = %unit.directory.display(),
                "unit listed twice, keeping the first entry"
            );
            continue;
        }
        units.insert_unique(unit.import_path.clone(), unit)?;
    }
    Ok(units)
}

/// Directories below `module_dir` holding a test source tagged `tag`.
fn tagged_test_dirs(toolchain: &dyn Toolchain, module_dir: &Path, tag: &str) -> Result<Vec<PathBuf>> {
    let mut dirs = BTreeSet::new();
    let walker = WalkDir::new(module_dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_skipped_dir(e));

    for entry in walker {
        let entry = entry.map_err(|e| PipelineError::Discovery {
            command: format!("scan {}", module_dir.display()),
            reason: e.to_string(),
        })?;
        let path = entry.path();
        if !entry.file_type().is_file() || !toolchain.is_test_source(path) {
            continue;
        }

        let contents = match std::fs::read(path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                warn!(file = %path.display(), error = %e, "unreadable source skipped");
                continue;
            }
        };
        if toolchain.has_build_tag(path, &contents, tag) {
            if let Some(parent) = path.parent() {
                dirs.insert(parent.to_path_buf());
            }
        }
    }
    Ok(dirs.into_iter().collect())
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{passing, ShellToolchain};
    use crate::toolchain::GoToolchain;
    use incrtest_core::CommandSpec;
    use std::time::Duration;

    #[tokio::test]
    async fn lists_units_from_toolchain() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = ShellToolchain::default()
            .unit("m/a", &dir.path().join("a"), passing("ok"))
            .unit("m/b", &dir.path().join("b"), passing("ok"));

        let units = discover_units(&toolchain, dir.path(), None).await.unwrap();
        assert_eq!(units.keys().collect::<Vec<_>>(), vec!["m/a", "m/b"]);
        assert_eq!(units["m/b"].directory, dir.path().join("b"));
    }

    #[tokio::test]
    async fn duplicate_listing_keeps_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut toolchain = ShellToolchain::default().unit("m/a", Path::new("/first"), passing("ok"));
        toolchain.listing.push_str("m/a:/second\n");

        let units = list_units(&toolchain, dir.path()).await.unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units["m/a"].directory, PathBuf::from("/first"));
    }

    /// Toolchain whose listing command is an arbitrary script.
    struct ScriptedListing(&'static str);

    impl Toolchain for ScriptedListing {
        fn list_command(&self, dir: &Path) -> CommandSpec {
            CommandSpec::new("sh", dir).args(["-c", self.0])
        }
        fn compile_command(&self, m: &Path, u: &TestUnit, b: &Path, f: &[String]) -> CommandSpec {
            GoToolchain::new().compile_command(m, u, b, f)
        }
        fn coverage_build_flags(&self) -> Vec<String> {
            Vec::new()
        }
        fn run_flags(&self, _: Duration, _: bool) -> Vec<String> {
            Vec::new()
        }
        fn run_command(
            &self,
            u: &TestUnit,
            b: &Path,
            f: &[String],
            _: Option<&crate::toolchain::CoverageTarget>,
        ) -> CommandSpec {
            GoToolchain::new().run_command(u, b, f, None)
        }
        fn is_test_source(&self, _: &Path) -> bool {
            false
        }
        fn has_build_tag(&self, _: &Path, _: &str, _: &str) -> bool {
            false
        }
    }

    /// Go toolchain that records which files had their contents inspected.
    #[derive(Default)]
    struct InspectedFiles(std::sync::Mutex<Vec<PathBuf>>);

    impl Toolchain for InspectedFiles {
        fn list_command(&self, dir: &Path) -> CommandSpec {
            GoToolchain::new().list_command(dir)
        }
        fn compile_command(&self, m: &Path, u: &TestUnit, b: &Path, f: &[String]) -> CommandSpec {
            GoToolchain::new().compile_command(m, u, b, f)
        }
        fn coverage_build_flags(&self) -> Vec<String> {
            Vec::new()
        }
        fn run_flags(&self, _: Duration, _: bool) -> Vec<String> {
            Vec::new()
        }
        fn run_command(
            &self,
            u: &TestUnit,
            b: &Path,
            f: &[String],
            _: Option<&crate::toolchain::CoverageTarget>,
        ) -> CommandSpec {
            GoToolchain::new().run_command(u, b, f, None)
        }
        fn is_test_source(&self, file: &Path) -> bool {
            GoToolchain::new().is_test_source(file)
        }
        fn has_build_tag(&self, file: &Path, contents: &str, tag: &str) -> bool {
            self.0.lock().unwrap().push(file.to_path_buf());
            GoToolchain::new().has_build_tag(file, contents, tag)
        }
    }

    #[tokio::test]
    async fn failing_listing_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = list_units(&ScriptedListing("echo 'no go.mod' 1>&2; exit 1"), dir.path())
            .await
            .unwrap_err();
        match err {
            PipelineError::Discovery { reason, .. } => assert!(reason.contains("no go.mod")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unparseable_listing_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = list_units(&ScriptedListing("echo garbage"), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Discovery { .. }));
    }

    #[tokio::test]
    async fn tag_filter_lists_only_tagged_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for sub in ["tagged", "plain", ".hidden", "vendor/dep"] {
            std::fs::create_dir_all(root.join(sub)).unwrap();
        }
        let tagged = "//go:build integration\n\npackage p\n";
        std::fs::write(root.join("tagged/x_test.go"), tagged).unwrap();
        std::fs::write(root.join("plain/x_test.go"), "package p\n").unwrap();
        std::fs::write(root.join(".hidden/x_test.go"), tagged).unwrap();
        std::fs::write(root.join("vendor/dep/x_test.go"), tagged).unwrap();

        let dirs = tagged_test_dirs(&GoToolchain::new(), root, "integration").unwrap();
        assert_eq!(dirs, vec![root.join("tagged")]);
    }

    #[tokio::test]
    async fn only_test_sources_are_read() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("pkg/assets")).unwrap();
        std::fs::write(root.join("pkg/x_test.go"), "//go:build e2e\npackage p\n").unwrap();
        std::fs::write(root.join("pkg/x.go"), "//go:build e2e\npackage p\n").unwrap();
        std::fs::write(root.join("pkg/assets/blob.bin"), [0u8, 159, 146, 150]).unwrap();

        let toolchain = InspectedFiles::default();
        let dirs = tagged_test_dirs(&toolchain, root, "e2e").unwrap();

        assert_eq!(dirs, vec![root.join("pkg")]);
        assert_eq!(*toolchain.0.lock().unwrap(), vec![root.join("pkg/x_test.go")]);
    }

    #[tokio::test]
    async fn no_tagged_sources_means_no_units() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x_test.go"), "package p\n").unwrap();
        let toolchain = ShellToolchain::default().unit("m/a", dir.path(), passing("ok"));

        let units = discover_units(&toolchain, dir.path(), Some("integration"))
            .await
            .unwrap();
        assert!(units.is_empty());
    }

    #[tokio::test]
    async fn tagged_dirs_are_listed_and_merged() {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["a", "b"] {
            std::fs::create_dir_all(dir.path().join(sub)).unwrap();
            std::fs::write(
                dir.path().join(sub).join("e2e_test.go"),
                "//go:build e2e\npackage p\n",
            )
            .unwrap();
        }
        // The fake lists the same units wherever it runs; the merge dedups them.
        let toolchain = ShellToolchain::default()
            .unit("m/a", &dir.path().join("a"), passing("ok"))
            .unit("m/b", &dir.path().join("b"), passing("ok"));

        let units = discover_units(&toolchain, dir.path(), Some("e2e")).await.unwrap();
        assert_eq!(units.len(), 2);
    }
}
