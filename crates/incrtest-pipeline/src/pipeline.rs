//! Stage steps: build, run, update, and all three end to end.
//!
//! Each step can run in its own process. Build and run persist their unit
//! maps through the [`StageStore`]; the following step loads them back.

use std::sync::Arc;

use tracing::{debug, info, Instrument};
use uuid::Uuid;

use incrtest_core::telemetry::{log_units, section};
use incrtest_core::{
    compare_to_index, hash_units, BuildState, CompiledUnit, IndexStore, PipelineError, Result,
    RunState, Stage, StageFile, StageStore, TestUnit, UnitSet,
};

use crate::compile::{compile_all, validate_compilation, CompileSettings};
use crate::config::{PipelineConfig, PipelineStep};
use crate::discovery::discover_units;
use crate::publish::{maybe_publish, PublishOutcome, PublishPolicy};
use crate::report::RunReport;
use crate::run::{run_changed, validate_runs, RunSettings};
use crate::toolchain::Toolchain;

pub struct Pipeline {
    config: PipelineConfig,
    toolchain: Arc<dyn Toolchain>,
    index_store: Arc<dyn IndexStore>,
    stages: StageStore,
}

impl Pipeline {
    /// Validate `config` and prepare the stage store.
    pub fn new(
        config: PipelineConfig,
        toolchain: Arc<dyn Toolchain>,
        index_store: Arc<dyn IndexStore>,
    ) -> Result<Self> {
        let config = config.validate()?;
        let stages = StageStore::new(config.steps_dir())?;
        Ok(Self {
            config,
            toolchain,
            index_store,
            stages,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stages(&self) -> &StageStore {
        &self.stages
    }

    /// Run one step, loading and persisting stage state as needed.
    ///
    /// Returns the publish outcome for steps that end with an index update.
    pub async fn execute(&self, step: PipelineStep) -> Result<Option<PublishOutcome>> {
        info!(step = step.name(), suite = %self.config.test_suite, "starting step");
        match step {
            PipelineStep::Build => {
                let build = self.build().await?;
                self.stages.persist(&build)?;
                Ok(None)
            }
            PipelineStep::Run => {
                let build: BuildState = self.stages.load(Stage::Build)?;
                let run = self.run(build).await?;
                self.stages.persist(&run)?;
                Ok(None)
            }
            PipelineStep::Update => {
                let run: RunState = self.stages.load(Stage::Run)?;
                self.check_lineage(&run)?;
                self.update(&run).await.map(Some)
            }
            PipelineStep::E2e => {
                let build = self.build().await?;
                self.stages.persist(&build)?;
                let run = self.run(build).await?;
                self.stages.persist(&run)?;
                self.update(&run).await.map(Some)
            }
        }
    }

    /// Discover, compile and hash every unit.
    pub async fn build(&self) -> Result<BuildState> {
        let pipeline_id = Uuid::new_v4();
        info!(%pipeline_id, "build stage");

        let units = discover_units(
            self.toolchain.as_ref(),
            &self.config.module_dir,
            self.config.tag_filter.as_deref(),
        )
        .instrument(section("Find Test Packages"))
        .await?;
        log_units("Packages", &units);

        let compiled = self.compile(units).instrument(section("Build Tests")).await?;
        log_units("Test Binaries", &compiled);

        let hashed = hash_units(compiled)
            .instrument(section("Hash Test Binaries"))
            .await?;
        log_units("Hashed Test Binaries", &hashed);

        Ok(StageFile::new(Stage::Build, pipeline_id, hashed))
    }

    async fn compile(&self, units: UnitSet<TestUnit>) -> Result<UnitSet<CompiledUnit>> {
        let mut flags = self.config.build_flags.clone();
        if self.config.collect_coverage {
            flags.extend(self.toolchain.coverage_build_flags());
        }
        let settings = Arc::new(CompileSettings {
            module_dir: self.config.module_dir.clone(),
            output_dir: self.config.build_dir.clone(),
            flags,
            max_concurrency: self.config.build_concurrency,
        });

        let outcomes = compile_all(Arc::clone(&self.toolchain), settings, units).await?;
        validate_compilation(&self.config.build_dir, outcomes).await
    }

    /// Compare against the index and run the units whose binary changed.
    pub async fn run(&self, build: BuildState) -> Result<RunState> {
        info!(pipeline_id = %build.pipeline_id, "run stage");

        let snapshot = self.index_store.load(&self.config.test_suite).await?;
        let diffed = compare_to_index(self.config.run_all_tests, build.units, &snapshot.index)?;
        let changed = diffed.values().filter(|u| u.should_run).count();
        info!(
            changed,
            cached = diffed.len() - changed,
            run_all = self.config.run_all_tests,
            "compared test binaries against the hash index"
        );

        let settings = Arc::new(RunSettings {
            output_dir: self.config.build_dir.clone(),
            flags: self
                .toolchain
                .run_flags(self.config.test_timeout, self.config.verbose),
            coverage_dir: self
                .config
                .collect_coverage
                .then(|| self.config.coverage_dir()),
            kill_timeout: self.config.kill_timeout(),
            max_concurrency: self.config.run_concurrency,
        });

        let outcomes = run_changed(Arc::clone(&self.toolchain), settings, &diffed)
            .instrument(section("Run Tests"))
            .await?;

        {
            let _section = section("Test Results").entered();
            RunReport::new(&diffed, &outcomes).log();
        }

        let executed = validate_runs(diffed, outcomes).await?;
        log_units("Test Results", &executed);

        Ok(StageFile::new(Stage::Run, build.pipeline_id, executed)
            .with_index_revision(snapshot.revision))
    }

    /// Publish the run's digests as the suite's new hash index.
    pub async fn update(&self, run: &RunState) -> Result<PublishOutcome> {
        info!(pipeline_id = %run.pipeline_id, "update stage");

        let policy = PublishPolicy {
            collect_coverage: self.config.collect_coverage,
            force_update_index: self.config.force_update_index,
            current_branch: self.config.current_branch.clone(),
            default_branch: self.config.default_branch.clone(),
        };
        maybe_publish(
            self.index_store.as_ref(),
            &self.config.test_suite,
            run.index_revision.as_deref(),
            &policy,
            &run.units,
        )
        .instrument(section("Update Hash Index"))
        .await
    }

    /// Reject a run state that does not descend from the build state beside it.
    fn check_lineage(&self, run: &RunState) -> Result<()> {
        let build: BuildState = match self.stages.load(Stage::Build) {
            Ok(build) => build,
            Err(PipelineError::MissingStageState { .. }) => {
                debug!("no build state next to run state, skipping lineage check");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if build.pipeline_id != run.pipeline_id {
            return Err(PipelineError::StageLineage {
                expected: build.pipeline_id.to_string(),
                actual: run.pipeline_id.to_string(),
            });
        }
        Ok(())
    }
}
