//! incrtest core
//!
//! Building blocks for the incremental test pipeline:
//! - per-unit records handed between stages
//! - streamed SHA-256 hashing of test binaries
//! - the persisted hash index and the comparator that decides what runs
//! - versioned stage files for split build/run/update invocations
//! - a bounded worker pool and logged process execution

pub mod error;
pub mod exec;
pub mod git;
pub mod hashing;
pub mod index;
pub mod pool;
pub mod state;
pub mod telemetry;
pub mod unit;

pub use error::{IndexStoreError, PipelineError, Result, UnitFailure};
pub use exec::{CommandSpec, Execution, ExitOutcome};
pub use hashing::{hash_file, hash_units};
pub use index::{compare_to_index, FsIndexStore, HashIndex, IndexSnapshot, IndexStore};
pub use pool::{PoolConfig, WorkerPool};
pub use state::{BuildState, RunState, Stage, StageFile, StageStore};
pub use unit::{
    CompileInfo, CompiledUnit, DiffedUnit, ExecInfo, ExecutedUnit, HashedUnit, RunInfo, TestUnit,
    UnitSet,
};
