//! Base and derived container image builds.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::{BaseImageSettings, ContainerSettings};
use crate::error::HarnessError;
use crate::pipeline::fetch::DependencyFetcher;
use crate::process::{Cmd, CommandRunner};

/// A named image and where it is built from.
///
/// Tags carry no history: building an existing tag replaces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub tag: String,
    /// Workspace-relative build context.
    pub context: PathBuf,
    /// Image this one is layered on, if any.
    pub parent: Option<String>,
}

pub struct ImageBuilder<'a> {
    workspace: &'a Path,
    container: &'a ContainerSettings,
    runner: &'a dyn CommandRunner,
}

impl<'a> ImageBuilder<'a> {
    pub fn new(
        workspace: &'a Path,
        container: &'a ContainerSettings,
        runner: &'a dyn CommandRunner,
    ) -> Self {
        Self {
            workspace,
            container,
            runner,
        }
    }

    /// Fetch the base image sources if needed, then build the base tag.
    pub fn build_base(&self, base: &BaseImageSettings) -> Result<(), HarnessError> {
        DependencyFetcher::new(self.workspace, self.runner).ensure_fetched(&base.source)?;
        info!(tag = %base.spec.tag, "building base image");
        self.build(&base.spec)
    }

    /// Build `spec` on top of its parent.
    ///
    /// The parent tag is not checked here; a missing parent surfaces as a
    /// failure of the engine's build command.
    pub fn build_derived(&self, spec: &ImageSpec) -> Result<(), HarnessError> {
        info!(
            tag = %spec.tag,
            parent = spec.parent.as_deref().unwrap_or("-"),
            "building image"
        );
        self.build(spec)
    }

    fn build(&self, spec: &ImageSpec) -> Result<(), HarnessError> {
        let cmd = Cmd::new(self.container.engine.as_str())
            .args(["build", "-t", spec.tag.as_str(), "."])
            .current_dir(self.workspace.join(&spec.context));
        self.runner
            .run(&cmd)
            .map(|_| ())
            .map_err(|source| HarnessError::ImageBuildFailed {
                tag: spec.tag.clone(),
                source: Box::new(source),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarnessConfig;
    use crate::process::testing::FakeRunner;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn base_build_fetches_source_then_builds_in_checkout() {
        let temp = TempDir::new().unwrap();
        let config = HarnessConfig::defaults(temp.path());
        let runner = FakeRunner::new();

        ImageBuilder::new(temp.path(), &config.container, &runner)
            .build_base(&config.base_image)
            .unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].command.starts_with("git clone"));
        assert_eq!(calls[1].command, "docker build -t renode:1.16 .");
        assert_eq!(
            calls[1].cwd.as_deref(),
            Some(temp.path().join("renode-docker").as_path())
        );
    }

    #[test]
    fn base_build_skips_clone_when_checkout_exists() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("renode-docker")).unwrap();
        let config = HarnessConfig::defaults(temp.path());
        let runner = FakeRunner::new();

        ImageBuilder::new(temp.path(), &config.container, &runner)
            .build_base(&config.base_image)
            .unwrap();

        assert_eq!(runner.count_matching("git clone"), 0);
    }

    #[test]
    fn derived_build_failure_is_typed() {
        let temp = TempDir::new().unwrap();
        let config = HarnessConfig::defaults(temp.path());
        let runner = FakeRunner::new().exit_with("build -t riscv-ecu-renode", 1);

        let err = ImageBuilder::new(temp.path(), &config.container, &runner)
            .build_derived(&config.image)
            .unwrap_err();

        match err {
            HarnessError::ImageBuildFailed { tag, .. } => assert_eq!(tag, "riscv-ecu-renode"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
