//! The persisted `import path → digest` hash index.
//!
//! The on-disk shape is a flat JSON object and must stay that way so
//! previously published indexes remain readable.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{IndexStoreError, Result};
use crate::exec::remove_stale;
use crate::unit::{DiffedUnit, HashedUnit, UnitSet};

/// Flat mapping from import path to hex digest.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct HashIndex(BTreeMap<String, String>);

impl HashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `digest` for `import_path`. Returns the digest it replaced.
    pub fn insert(&mut self, import_path: impl Into<String>, digest: impl Into<String>) -> Option<String> {
        self.0.insert(import_path.into(), digest.into())
    }
}

impl Deref for HashIndex {
    type Target = BTreeMap<String, String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromIterator<(String, String)> for HashIndex {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Whether a unit must run given its current digest and the indexed one.
pub fn should_run(run_all_tests: bool, digest: &str, indexed: Option<&str>) -> bool {
    match indexed {
        _ if run_all_tests => true,
        None => true,
        Some(previous) => previous != digest,
    }
}

/// Classify each hashed unit as must-run or skippable against `index`.
///
/// Index entries with no matching unit are logged and otherwise ignored.
pub fn compare_to_index(
    run_all_tests: bool,
    units: UnitSet<HashedUnit>,
    index: &HashIndex,
) -> Result<UnitSet<DiffedUnit>> {
    for stale in index.keys().filter(|k| !units.contains_key(*k)) {
        info!(unit = %stale, "indexed unit no longer exists");
    }

    let mut diffed = UnitSet::new();
    for (import_path, hashed) in units {
        let index_hash = index.get(&import_path).cloned();
        let run = should_run(run_all_tests, &hashed.hash, index_hash.as_deref());
        debug!(unit = %import_path, should_run = run, "compared against index");
        diffed.insert_unique(
            import_path,
            DiffedUnit {
                hashed,
                index_hash,
                should_run: run,
            },
        )?;
    }
    Ok(diffed)
}

/// A loaded index together with the store revision it was read at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSnapshot {
    pub index: HashIndex,

    /// Opaque revision token; `None` when nothing was stored yet.
    pub revision: Option<String>,
}

/// Backing store for hash indexes, one per test suite.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Load the index for `suite`. A suite with no stored index loads empty.
    async fn load(&self, suite: &str) -> std::result::Result<IndexSnapshot, IndexStoreError>;

    /// Publish `index` for `suite`, failing with [`IndexStoreError::Conflict`]
    /// if the stored revision is no longer `base_revision`.
    async fn publish(
        &self,
        suite: &str,
        index: &HashIndex,
        base_revision: Option<&str>,
    ) -> std::result::Result<String, IndexStoreError>;
}

/// Filesystem index store: `<root>/<suite>.json`.
///
/// The revision of a stored index is the SHA-256 of its bytes.
pub struct FsIndexStore {
    root: PathBuf,
}

impl FsIndexStore {
    pub fn new(root: impl AsRef<Path>) -> std::result::Result<Self, IndexStoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn index_path(&self, suite: &str) -> PathBuf {
        self.root.join(format!("{suite}.json"))
    }

    fn read_current(&self, suite: &str) -> std::result::Result<Option<Vec<u8>>, IndexStoreError> {
        match fs::read(self.index_path(suite)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// A publish lock older than this is assumed to belong to a dead process.
pub const STALE_LOCK_AFTER: Duration = Duration::from_secs(300);

/// Exclusive `<suite>.json.lock` held across the revision check and the
/// rename. Removed on drop.
struct PublishLock {
    path: PathBuf,
}

impl PublishLock {
    /// `Ok(None)` when another publisher holds the lock.
    fn acquire(path: PathBuf) -> std::io::Result<Option<Self>> {
        for _ in 0..2 {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Some(Self { path })),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if !is_stale(&path) {
                        return Ok(None);
                    }
                    warn!(lock = %path.display(), "removing stale publish lock");
                    remove_stale(&path)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

impl Drop for PublishLock {
    fn drop(&mut self) {
        if let Err(e) = remove_stale(&self.path) {
            warn!(lock = %self.path.display(), error = %e, "failed to release publish lock");
        }
    }
}

fn is_stale(lock: &Path) -> bool {
    fs::metadata(lock)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > STALE_LOCK_AFTER)
}

fn revision_of(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[async_trait]
impl IndexStore for FsIndexStore {
    async fn load(&self, suite: &str) -> std::result::Result<IndexSnapshot, IndexStoreError> {
        let path = self.index_path(suite);
        match self.read_current(suite)? {
            Some(bytes) => {
                info!(path = %path.display(), "loaded hash index");
                Ok(IndexSnapshot {
                    index: serde_json::from_slice(&bytes)?,
                    revision: Some(revision_of(&bytes)),
                })
            }
            None => {
                warn!(path = %path.display(), "no hash index found, every unit will run");
                Ok(IndexSnapshot::default())
            }
        }
    }

    async fn publish(
        &self,
        suite: &str,
        index: &HashIndex,
        base_revision: Option<&str>,
    ) -> std::result::Result<String, IndexStoreError> {
        let lock_path = self.root.join(format!("{suite}.json.lock"));
        let Some(_lock) = PublishLock::acquire(lock_path)? else {
            debug!(suite, "another publisher holds the index lock");
            return Err(IndexStoreError::Conflict {
                suite: suite.to_string(),
                expected: base_revision.map(str::to_string),
                actual: None,
            });
        };

        let current = self.read_current(suite)?.map(|b| revision_of(&b));
        if current.as_deref() != base_revision {
            return Err(IndexStoreError::Conflict {
                suite: suite.to_string(),
                expected: base_revision.map(str::to_string),
                actual: current,
            });
        }

        let bytes = serde_json::to_vec_pretty(index)?;

        // Atomic write: temp file in the same directory, then rename.
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(&bytes)?;
        tmp.persist(self.index_path(suite)).map_err(|e| e.error)?;

        Ok(revision_of(&bytes))
    }
}
