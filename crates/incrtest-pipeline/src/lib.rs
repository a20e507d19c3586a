//! incrtest pipeline
//!
//! The stages of an incremental test run:
//! - discover test units through a [`Toolchain`]
//! - compile them in a bounded worker pool and hash the binaries
//! - run only the units whose binary changed since the last published index
//! - report results and publish the new index from trusted runs

pub mod compile;
pub mod config;
pub mod discovery;
pub mod pipeline;
pub mod publish;
pub mod report;
pub mod run;
pub mod toolchain;

#[cfg(test)]
mod testing;

pub use compile::{CompileOutcome, CompileSettings};
pub use config::{PipelineConfig, PipelineStep};
pub use discovery::discover_units;
pub use pipeline::Pipeline;
pub use publish::{PublishDecision, PublishOutcome, PublishPolicy, SkipReason};
pub use report::{format_duration, RunReport};
pub use run::{RunOutcome, RunSettings};
pub use toolchain::{CoverageTarget, GoToolchain, Toolchain};
