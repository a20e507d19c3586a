//! Content hashing of compiled test binaries.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::unit::{CompiledUnit, HashedUnit, UnitSet};

/// Stream `path` through SHA-256 and return the hex digest.
///
/// The file is read in buffered chunks, never loaded whole.
pub fn hash_file(path: &Path) -> Result<String> {
    let hash_err = |source: io::Error| PipelineError::Hash {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(hash_err)?;
    let mut reader = BufReader::with_capacity(64 * 1024, file);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher).map_err(hash_err)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Hash every compiled unit's binary.
///
/// Runs on the blocking pool since binaries can be hundreds of megabytes.
pub async fn hash_units(compiled: UnitSet<CompiledUnit>) -> Result<UnitSet<HashedUnit>> {
    tokio::task::spawn_blocking(move || {
        let mut hashed = UnitSet::new();
        for (import_path, unit) in compiled {
            let hash = hash_file(&unit.compile.binary)?;
            debug!(unit = %import_path, hash = %hash, "hashed test binary");
            hashed.insert_unique(
                import_path,
                HashedUnit {
                    compiled: unit,
                    hash,
                },
            )?;
        }
        Ok(hashed)
    })
    .await
    .map_err(|e| PipelineError::WorkerPanicked(format!("hashing task: {e}")))?
}
