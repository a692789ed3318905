//! Build pipeline: stages, their prerequisites, and sequential execution.
//!
//! ```text
//! fetch-dependencies ─────────────▶ build-firmware ─┐
//! build-base-image ─▶ build-image ──────────────────┴─▶ run
//! clean (independent)
//! ```
//!
//! Each stage blocks on its external commands. A failed stage aborts the
//! pipeline; the one exception is a compile failure on the way to `run`
//! when `firmware.continue_on_failure` is set.

pub mod clean;
pub mod fetch;
pub mod firmware;
pub mod image;

use std::fmt;
use std::io::Write;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::HarnessConfig;
use crate::error::HarnessError;
use crate::executor::ContainerExecutor;
use crate::process::CommandRunner;
use crate::runtime::emulator::RunResult;
use crate::runtime::RuntimeBootstrapper;

use clean::WorkspaceCleaner;
use fetch::DependencyFetcher;
use firmware::FirmwareCompiler;
use image::ImageBuilder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    FetchDependencies,
    BuildBaseImage,
    BuildImage,
    BuildFirmware,
    Run,
    Clean,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::FetchDependencies,
        Stage::BuildBaseImage,
        Stage::BuildImage,
        Stage::BuildFirmware,
        Stage::Run,
        Stage::Clean,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::FetchDependencies => "fetch-dependencies",
            Stage::BuildBaseImage => "build-base-image",
            Stage::BuildImage => "build-image",
            Stage::BuildFirmware => "build-firmware",
            Stage::Run => "run",
            Stage::Clean => "clean",
        }
    }

    /// Stages that must complete before this one, in execution order.
    pub fn prerequisites(self) -> &'static [Stage] {
        match self {
            Stage::BuildImage => &[Stage::BuildBaseImage],
            Stage::BuildFirmware => &[Stage::FetchDependencies],
            Stage::Run => &[Stage::BuildImage, Stage::BuildFirmware],
            Stage::FetchDependencies | Stage::BuildBaseImage | Stage::Clean => &[],
        }
    }

    /// Whether the stage runs anything inside a container.
    pub fn uses_container(self) -> bool {
        !matches!(self, Stage::FetchDependencies | Stage::Clean)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Every stage needed to reach `target`, prerequisites first, each once.
pub fn plan(target: Stage) -> Vec<Stage> {
    fn visit(stage: Stage, order: &mut Vec<Stage>) {
        if order.contains(&stage) {
            return;
        }
        for &prerequisite in stage.prerequisites() {
            visit(prerequisite, order);
        }
        order.push(stage);
    }

    let mut order = Vec::new();
    visit(target, &mut order);
    order
}

/// A stage failed and the pipeline stopped.
#[derive(Debug, Error)]
#[error("stage '{stage}' failed")]
pub struct StageFailure {
    pub stage: Stage,
    #[source]
    pub source: HarnessError,
}

impl StageFailure {
    pub fn exit_code(&self) -> i32 {
        self.source.exit_code()
    }
}

pub struct Pipeline<'a> {
    config: &'a HarnessConfig,
    runner: &'a dyn CommandRunner,
    session_name: String,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a HarnessConfig, runner: &'a dyn CommandRunner) -> Self {
        Self {
            config,
            runner,
            session_name: format!("ecu-harness-{}", std::process::id()),
        }
    }

    /// Container name used for the `run` session.
    pub fn with_session_name(mut self, name: impl Into<String>) -> Self {
        self.session_name = name.into();
        self
    }

    /// Execute [`plan`]`(target)` in order.
    ///
    /// Returns the emulator outcome when `target` is [`Stage::Run`]. A
    /// non-zero emulator exit is reported there, not as a failure.
    pub fn execute(
        &self,
        target: Stage,
        out: &mut dyn Write,
    ) -> Result<Option<RunResult>, StageFailure> {
        let mut result = None;
        for stage in plan(target) {
            info!(stage = stage.name(), "stage started");
            match self.run_stage(stage, out) {
                Ok(run) => {
                    if run.is_some() {
                        result = run;
                    }
                    info!(stage = stage.name(), "stage finished");
                }
                Err(HarnessError::CompileFailed { output, source })
                    if stage != target && self.config.firmware.continue_on_failure =>
                {
                    warn!(
                        output = %output,
                        "firmware compile failed, continuing with the existing artifact: {source}"
                    );
                }
                Err(source) => return Err(StageFailure { stage, source }),
            }
        }
        Ok(result)
    }

    fn run_stage(
        &self,
        stage: Stage,
        out: &mut dyn Write,
    ) -> Result<Option<RunResult>, HarnessError> {
        let config = self.config;
        match stage {
            Stage::FetchDependencies => {
                let cloned = DependencyFetcher::new(&config.workspace, self.runner)
                    .ensure_all(&config.dependencies)?;
                info!(cloned, total = config.dependencies.len(), "dependencies ready");
            }
            Stage::BuildBaseImage => {
                self.images().build_base(&config.base_image)?;
            }
            Stage::BuildImage => {
                self.images().build_derived(&config.image)?;
            }
            Stage::BuildFirmware => {
                let executor = ContainerExecutor::new(config, &config.image.tag, self.runner);
                let artifact = FirmwareCompiler::new(&config.workspace, &executor)
                    .compile(&config.firmware.job)?;
                info!(artifact = %artifact.display(), "firmware built");
            }
            Stage::Run => {
                let executor = ContainerExecutor::new(config, &config.image.tag, self.runner);
                let result =
                    RuntimeBootstrapper::new(config, &executor).run(&self.session_name, out)?;
                return Ok(Some(result));
            }
            Stage::Clean => {
                let removed = WorkspaceCleaner::new(config).clean()?;
                info!(removed = removed.len(), "workspace cleaned");
            }
        }
        Ok(None)
    }

    fn images(&self) -> ImageBuilder<'a> {
        ImageBuilder::new(&self.config.workspace, &self.config.container, self.runner)
    }
}
