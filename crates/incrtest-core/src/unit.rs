//! Per-unit records handed from stage to stage.
//!
//! Each stage wraps the previous stage's record and adds its own fields:
//! `TestUnit` → `CompiledUnit` → `HashedUnit` → `DiffedUnit` → `ExecutedUnit`.
//! Records are serialized flat, so a stage file entry for a unit reads as a
//! single JSON object.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// A compilable group of tests identified by its import path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestUnit {
    /// Unique key, e.g. `github.com/org/repo/pkg/store`.
    pub import_path: String,

    /// Source directory. Test binaries run with this as their working directory.
    pub directory: PathBuf,
}

impl TestUnit {
    pub fn new(import_path: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            import_path: import_path.into(),
            directory: directory.into(),
        }
    }

    /// File stem shared by the unit's binary and logs.
    ///
    /// `/` becomes `-`; literal `-` and `%` are percent-escaped so distinct
    /// import paths always get distinct stems.
    pub fn artifact_stem(&self) -> String {
        let mut stem = String::with_capacity(self.import_path.len() + 5);
        for c in self.import_path.chars() {
            match c {
                '/' => stem.push('-'),
                '-' => stem.push_str("%2D"),
                '%' => stem.push_str("%25"),
                c => stem.push(c),
            }
        }
        stem.push_str("-test");
        stem
    }
}

/// General information about one external process execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecInfo {
    /// Full command line.
    pub command: String,

    /// Exit code, `-1` when terminated by a signal or killed on timeout.
    pub exit_code: i32,

    /// Working directory.
    pub cwd: PathBuf,

    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompileInfo {
    pub binary: PathBuf,
    pub log: PathBuf,
    pub execution: ExecInfo,
}

/// A unit whose compilation produced a test binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompiledUnit {
    #[serde(flatten)]
    pub unit: TestUnit,
    pub compile: CompileInfo,
}

/// A compiled unit plus the hex SHA-256 of its binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HashedUnit {
    #[serde(flatten)]
    pub compiled: CompiledUnit,
    pub hash: String,
}

impl HashedUnit {
    pub fn import_path(&self) -> &str {
        &self.compiled.unit.import_path
    }

    pub fn unit(&self) -> &TestUnit {
        &self.compiled.unit
    }

    pub fn binary(&self) -> &PathBuf {
        &self.compiled.compile.binary
    }
}

/// A hashed unit compared against the persisted index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffedUnit {
    #[serde(flatten)]
    pub hashed: HashedUnit,

    /// Digest recorded in the index, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_hash: Option<String>,

    pub should_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunInfo {
    pub log: PathBuf,

    /// Coverage profile, only set when coverage was collected and the run passed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<PathBuf>,

    pub execution: ExecInfo,
}

/// Final per-unit record. `run` is `None` for units served from the cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutedUnit {
    #[serde(flatten)]
    pub diffed: DiffedUnit,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<RunInfo>,
}

impl ExecutedUnit {
    pub fn import_path(&self) -> &str {
        self.diffed.hashed.import_path()
    }

    pub fn hash(&self) -> &str {
        &self.diffed.hashed.hash
    }
}

/// Import-path keyed map of unit records.
///
/// Iteration is always sorted by import path. Inserting an existing key is
/// rejected and leaves the original entry untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct UnitSet<T>(BTreeMap<String, T>);

impl<T> Default for UnitSet<T> {
    fn default() -> Self {
        Self(BTreeMap::new())
    }
}

impl<T> UnitSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value` under `key` unless the key is already taken.
    pub fn insert_unique(&mut self, key: impl Into<String>, value: T) -> Result<()> {
        let key = key.into();
        if self.0.contains_key(&key) {
            return Err(PipelineError::DuplicateUnit(key));
        }
        self.0.insert(key, value);
        Ok(())
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut T> {
        self.0.get_mut(key)
    }

    pub fn into_inner(self) -> BTreeMap<String, T> {
        self.0
    }

    pub fn into_values(self) -> impl Iterator<Item = T> {
        self.0.into_values()
    }
}

impl<T> Deref for UnitSet<T> {
    type Target = BTreeMap<String, T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> IntoIterator for UnitSet<T> {
    type Item = (String, T);
    type IntoIter = std::collections::btree_map::IntoIter<String, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a UnitSet<T> {
    type Item = (&'a String, &'a T);
    type IntoIter = std::collections::btree_map::Iter<'a, String, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_stem_flattens_import_path() {
        let unit = TestUnit::new("github.com/acme/core/store", "/src/store");
        assert_eq!(unit.artifact_stem(), "github.com-acme-core-store-test");
    }

    #[test]
    fn artifact_stem_separates_hyphens_from_slashes() {
        let hyphen = TestUnit::new("m/x-y", "/src/x-y");
        let nested = TestUnit::new("m/x/y", "/src/x/y");
        assert_eq!(hyphen.artifact_stem(), "m-x%2Dy-test");
        assert_eq!(nested.artifact_stem(), "m-x-y-test");

        let escaped = TestUnit::new("m/x%2Dy", "/src/odd");
        assert_eq!(escaped.artifact_stem(), "m-x%252Dy-test");
    }

    #[test]
    fn insert_unique_keeps_first_entry() {
        let mut set = UnitSet::new();
        set.insert_unique("a/b", TestUnit::new("a/b", "/first"))
            .expect("first insert");

        let err = set
            .insert_unique("a/b", TestUnit::new("a/b", "/second"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateUnit(ref k) if k == "a/b"));
        assert_eq!(set.len(), 1);
        assert_eq!(set["a/b"].directory, PathBuf::from("/first"));
    }

    #[test]
    fn unit_set_iterates_sorted() {
        let mut set = UnitSet::new();
        for key in ["z/pkg", "a/pkg", "m/pkg"] {
            set.insert_unique(key, ()).unwrap();
        }
        let keys: Vec<_> = set.keys().cloned().collect();
        assert_eq!(keys, vec!["a/pkg", "m/pkg", "z/pkg"]);
    }

    #[test]
    fn executed_unit_serializes_flat() {
        let executed = ExecutedUnit {
            diffed: DiffedUnit {
                hashed: fixtures::hashed("a/b", "h1"),
                index_hash: None,
                should_run: true,
            },
            run: None,
        };

        let value = serde_json::to_value(&executed).unwrap();
        assert_eq!(value["import_path"], "a/b");
        assert_eq!(value["hash"], "h1");
        assert_eq!(value["should_run"], true);
        assert!(value.get("run").is_none());
        assert!(value.get("index_hash").is_none());

        let back: ExecutedUnit = serde_json::from_value(value).unwrap();
        assert_eq!(back, executed);
    }
}
